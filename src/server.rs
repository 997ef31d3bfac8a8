//! The single-threaded (cooperatively scheduled) main loop: SSDP
//! receive, HTTP accept, event-engine notify completions, and the
//! periodic alive-notify tick all meet in one `tokio::select!`. Media
//! transfer is the only part of the server that leaves this loop, via
//! the dedicated thread spawned in [`crate::http`].

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::events::{EventEngine, NotifyOutcome};
use crate::http::{self, HttpContext};
use crate::iface::InterfaceManager;
use crate::ssdp;

async fn shutdown(iface_mgr: &InterfaceManager, config: &Config, server_string: &str, events: &Arc<Mutex<EventEngine>>) {
    info!("shutting down");
    ssdp::send_all_goodbyes(&iface_mgr.bindings, &iface_mgr.device_uuid, config.port, server_string, config.notify_interval).await;
    events.lock().await.teardown();
    if let Some(pid_file) = &config.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let mut iface_mgr = InterfaceManager::new(config.interfaces.clone());
    if let Some(u) = config.uuid_override {
        iface_mgr.device_uuid = u;
    }
    iface_mgr.reload(false).await;

    let device_uuid = iface_mgr.device_uuid;
    let server_string = config.server_string();

    if let Some(pid_file) = &config.pid_file {
        std::fs::write(pid_file, format!("{}\n", std::process::id()))?;
    }

    let (event_engine, mut notify_rx) = EventEngine::new(device_uuid);
    let events = Arc::new(Mutex::new(event_engine));

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let our_host = format!(
        "{}:{}",
        iface_mgr.primary_addr().unwrap_or(Ipv4Addr::UNSPECIFIED),
        config.port
    );

    let recv_sock = ssdp::bind_receive_socket(&iface_mgr.bindings)?;

    ssdp::send_all_notifies(&iface_mgr.bindings, &device_uuid, config.port, &server_string, config.notify_interval).await;

    let ctx = Arc::new(HttpContext {
        media_root: config.media_dir.clone(),
        our_host,
        device_uuid,
        friendly_name: config.friendly_name.clone(),
        events: events.clone(),
        max_connections: config.max_connections,
        active_streams: Arc::new(std::sync::Mutex::new(0)),
    });

    let mut notify_tick = tokio::time::interval(Duration::from_secs(config.notify_interval.max(1)));
    notify_tick.tick().await; // consume the immediate first tick; the initial burst was already sent above

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let mut recv_buf = vec![0u8; 4096];

    info!("listening on http://{}", ctx.our_host);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move { http::handle_connection(stream, ctx).await; });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
            recvd = recv_sock.recv_from(&mut recv_buf) => {
                if let Ok((n, from)) = recvd {
                    ssdp::handle_datagram(&recv_sock, &recv_buf[..n], from, &device_uuid, config.port, config.notify_interval, &server_string).await;
                }
            }
            outcome = notify_rx.recv() => {
                if let Some(outcome) = outcome {
                    let mut engine = events.lock().await;
                    match outcome {
                        NotifyOutcome::Finished(idx) => engine.reap(idx, true),
                        NotifyOutcome::Error(idx) => engine.reap(idx, false),
                    }
                }
            }
            _ = notify_tick.tick() => {
                ssdp::send_all_notifies(&iface_mgr.bindings, &device_uuid, config.port, &server_string, config.notify_interval).await;
                events.lock().await.sweep_expired();
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading interfaces");
                ssdp::reload_interfaces(&mut iface_mgr, config.port, &server_string, config.notify_interval).await;
            }
            _ = sigterm.recv() => {
                shutdown(&iface_mgr, &config, &server_string, &events).await;
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                shutdown(&iface_mgr, &config, &server_string, &events).await;
                return Ok(());
            }
        }
    }
}
