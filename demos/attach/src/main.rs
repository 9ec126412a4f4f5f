//! Attach to a running host process and exercise a session.
//!
//! Connects, announces itself, prints the channel id, answers `ping`
//! requests, logs `redraw` notifications, and stays attached until the host
//! hangs up.
//!
//! # Usage
//!
//! ```bash
//! # Unix socket (e.g. `nvim --listen /tmp/nvim.sock`)
//! mprpc-attach --addr=/tmp/nvim.sock
//!
//! # TCP
//! mprpc-attach --addr=127.0.0.1:6666
//!
//! # Call something once attached
//! mprpc-attach --addr=/tmp/nvim.sock --call=nvim_get_current_line
//! ```

use std::sync::Arc;

use mprpc_core::{
    ClientInfo, ClientType, ClientVersion, RpcError, RpcSession, SessionConfig, Transport,
    TransportError, Value,
};
use tracing::{error, info};

#[derive(Debug)]
struct Args {
    /// TCP address or Unix socket path
    addr: String,
    call: Option<String>,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut addr = None;
        let mut call = None;

        for arg in std::env::args().skip(1) {
            if let Some(a) = arg.strip_prefix("--addr=") {
                addr = Some(a.to_string());
            } else if let Some(m) = arg.strip_prefix("--call=") {
                call = Some(m.to_string());
            } else {
                return Err(format!("unknown argument: {arg}"));
            }
        }

        Ok(Self {
            addr: addr.ok_or("--addr required")?,
            call,
        })
    }
}

/// Socket paths may contain ':', so anything that looks like a path or
/// names an existing file is a Unix socket; the rest is `host:port`.
fn is_socket_path(addr: &str) -> bool {
    addr.contains('/')
        || addr.contains(std::path::MAIN_SEPARATOR)
        || std::path::Path::new(addr).exists()
}

async fn connect(addr: &str) -> Result<Transport, TransportError> {
    if !is_socket_path(addr) {
        return Transport::tcp(addr).await;
    }

    #[cfg(unix)]
    {
        Transport::unix(addr).await
    }
    #[cfg(not(unix))]
    {
        Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Unix sockets not supported on this platform",
        )))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse()?;
    let transport = connect(&args.addr).await?;
    info!(addr = %args.addr, "connected");

    let client_info = ClientInfo::new("mprpc-attach")
        .with_version(ClientVersion::new(0, 1, 0))
        .with_type(ClientType::Remote);
    let config = SessionConfig::from_env().with_client_info(client_info);
    let session = Arc::new(RpcSession::with_config(transport, config));

    session.on_request("ping", |_args| async { Ok(Value::from("pong")) });
    session.on_notification("redraw", |args| async move {
        info!(batches = args.len(), "redraw");
    });

    let Some(run) = session.start() else {
        return Err("session did not start".into());
    };

    let channel = session.channel_id().await?;
    println!("attached as channel {channel}");

    if let Some(method) = &args.call {
        match session.call(method, Vec::new()).await {
            Ok(value) => println!("{method} -> {value}"),
            Err(RpcError::Remote(message)) => println!("{method} failed: {message}"),
            Err(e) => return Err(e.into()),
        }
    }

    session.closed().await;
    match run.await? {
        Ok(()) => info!("host hung up"),
        Err(err) => error!(%err, "session ended with error"),
    }
    Ok(())
}
