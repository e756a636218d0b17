//! IPC Client - 与守护进程通信

use anyhow::Result;
use runchicken_core::ipc::{IpcRequest, IpcResponse, socket_path};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub async fn send_request(request: IpcRequest) -> Result<IpcResponse> {
    let path = socket_path();

    let stream = match UnixStream::connect(&path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ 无法连接到守护进程: {}", e);
            eprintln!("   请确保 runchicken-daemon 正在运行");
            eprintln!("   运行: cargo xtask dev 或 systemctl start runchicken");
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // 发送请求
    let json = serde_json::to_string(&request)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    // 读取响应
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: IpcResponse = serde_json::from_str(&line)?;

    // 错误由调用方报告
    if let IpcResponse::Ok { message } = &response {
        println!("✅ {}", message);
    }

    Ok(response)
}
