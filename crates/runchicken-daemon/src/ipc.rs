//! IPC Server - Unix Domain Socket 通信

use anyhow::Result;
use runchicken_core::ipc::{IpcRequest, IpcResponse, socket_path};
use runchicken_core::{RunChickenDevice, Transport};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

pub async fn run_ipc_server<T: Transport>(device: Arc<RunChickenDevice<T>>) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC 服务器已启动: {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let device = Arc::clone(&device);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, device).await {
                        tracing::debug!("IPC 客户端断开: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("接受连接失败: {}", e);
            }
        }
    }
}

async fn handle_client<T: Transport>(
    stream: UnixStream,
    device: Arc<RunChickenDevice<T>>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                tracing::debug!("收到请求: {:?}", request);
                handle_request(&device, request).await
            }
            Err(e) => IpcResponse::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
        line.clear();
    }

    Ok(())
}

async fn handle_request<T: Transport>(
    device: &RunChickenDevice<T>,
    request: IpcRequest,
) -> IpcResponse {
    match request {
        IpcRequest::Status => state_response(device),
        IpcRequest::Open => {
            tracing::info!("开门");
            match device.open().await {
                Ok(()) => IpcResponse::Ok {
                    message: "开门命令已发送".to_string(),
                },
                Err(e) => error_response(&e),
            }
        }
        IpcRequest::Close => {
            tracing::info!("关门");
            match device.close().await {
                Ok(()) => IpcResponse::Ok {
                    message: "关门命令已发送".to_string(),
                },
                Err(e) => error_response(&e),
            }
        }
        IpcRequest::Poll => match device.poll_now().await {
            Ok(_) => state_response(device),
            Err(e) => error_response(&e),
        },
    }
}

fn state_response<T: Transport>(device: &RunChickenDevice<T>) -> IpcResponse {
    IpcResponse::State {
        state: device.current_state(),
        session: device.session_status().to_string(),
    }
}

fn error_response(e: &runchicken_core::Error) -> IpcResponse {
    tracing::warn!("请求失败: {}", e);
    IpcResponse::Error {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runchicken_core::{DeviceOptions, DoorState, MockTransport};

    async fn roundtrip(client: &mut BufReader<UnixStream>, request: &str) -> IpcResponse {
        client
            .get_mut()
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .unwrap();
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_requests_over_socket() {
        let mock = Arc::new(MockTransport::new());
        let mut closed = vec![0u8; 17];
        closed.push(1);
        mock.set_status_payload(&closed);

        let device = Arc::new(RunChickenDevice::new(
            Arc::clone(&mock),
            Some("00:80:E1:22:43:0D".to_string()),
            DeviceOptions::default(),
        ));
        let (server, client) = UnixStream::pair().unwrap();
        tokio::spawn(handle_client(server, device));
        let mut client = BufReader::new(client);

        match roundtrip(&mut client, r#"{"type":"status"}"#).await {
            IpcResponse::State { state, session } => {
                assert_eq!(state.door_state, DoorState::Unknown);
                assert_eq!(session, "disconnected");
            }
            other => panic!("unexpected response: {:?}", other),
        }

        match roundtrip(&mut client, r#"{"type":"poll"}"#).await {
            IpcResponse::State { state, .. } => assert_eq!(state.door_state, DoorState::Closed),
            other => panic!("unexpected response: {:?}", other),
        }

        assert!(matches!(
            roundtrip(&mut client, r#"{"type":"open"}"#).await,
            IpcResponse::Ok { .. }
        ));
        assert_eq!(mock.written(runchicken_core::Channel::Command).len(), 1);

        assert!(matches!(
            roundtrip(&mut client, r#"{"type":"launch"}"#).await,
            IpcResponse::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_errors_are_reported() {
        let mock = Arc::new(MockTransport::new());
        let device = Arc::new(RunChickenDevice::new(mock, None, DeviceOptions::default()));
        let (server, client) = UnixStream::pair().unwrap();
        tokio::spawn(handle_client(server, device));
        let mut client = BufReader::new(client);

        match roundtrip(&mut client, r#"{"type":"close"}"#).await {
            IpcResponse::Error { message } => {
                assert_eq!(message, "No device address associated with this session");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
