//! Per-connection HTTP handling (§4.J): one task per accepted TCP
//! connection, always closed after a single response.

pub mod request;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::chunked::ChunkedWriter;
use crate::events::{self, EventEngine, SubscribeRequest, SubscribeResult};
use crate::media::{self, MediaOutcome, MediaRequestArgs};
use crate::soap;
use crate::static_xml;
use request::{gate_check, parse_request, Method, Request};

pub struct HttpContext {
    pub media_root: PathBuf,
    pub our_host: String,
    pub device_uuid: Uuid,
    pub friendly_name: String,
    pub events: Arc<Mutex<EventEngine>>,
    pub max_connections: usize,
    pub active_streams: Arc<std::sync::Mutex<usize>>,
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "200 OK",
        206 => "206 Partial Content",
        400 => "400 Bad Request",
        401 => "401 Invalid Action",
        403 => "403 Forbidden",
        404 => "404 Not Found",
        406 => "406 Not Acceptable",
        412 => "412 Precondition Failed",
        416 => "416 Range Not Satisfiable",
        500 => "500 Internal Server Error",
        503 => "503 Service Unavailable",
        708 => "708 Unsupported Action",
        _ => "500 Internal Server Error",
    }
}

async fn write_status_only(mut stream: TcpStream, status: u16) {
    let resp = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        status = status_text(status),
    );
    if let Err(e) = stream.write_all(resp.as_bytes()).await {
        debug!("failed writing error response: {e}");
    }
}

async fn write_with_headers(mut stream: TcpStream, status: u16, extra_headers: &[(&str, &str)]) {
    let mut resp = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n",
        status = status_text(status),
    );
    for (name, value) in extra_headers {
        resp.push_str(&format!("{name}: {value}\r\n"));
    }
    resp.push_str("\r\n");
    if let Err(e) = stream.write_all(resp.as_bytes()).await {
        debug!("failed writing response: {e}");
    }
}

async fn respond_chunked(stream: TcpStream, status: u16, content_type: &str, body: &str) {
    let header = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: {content_type}\r\nTransfer-Encoding: chunked\r\n\r\n",
        status = status_text(status),
    );
    let mut writer = ChunkedWriter::new(stream);
    writer.raw_write(header.as_bytes()).await;
    writer.push_str(body);
    let _ = writer.finish().await;
}

/// Parses the request line/headers and routes to the matching handler.
/// Connections that fail to parse at all are dropped silently: there is
/// no well-formed request to answer.
pub async fn handle_connection(stream: TcpStream, ctx: Arc<HttpContext>) {
    let mut reader = BufReader::new(stream);
    let req = match parse_request(&mut reader, &ctx.our_host).await {
        Ok(r) => r,
        Err(e) => {
            debug!("dropping unparsable request: {e}");
            return;
        }
    };

    if let Some(status) = gate_check(&req) {
        write_status_only(reader.into_inner(), status).await;
        return;
    }

    match req.method {
        Method::Get | Method::Head if req.path.starts_with("/MediaItems/") => {
            serve_media(reader.into_inner(), req, ctx).await;
        }
        Method::Get if req.path == "/rootDesc.xml" => {
            let body = static_xml::root_desc_xml(&ctx.friendly_name, &ctx.device_uuid);
            respond_chunked(reader.into_inner(), 200, "text/xml; charset=\"utf-8\"", &body).await;
        }
        Method::Get if req.path == "/ContentDir.xml" => {
            respond_chunked(reader.into_inner(), 200, "text/xml; charset=\"utf-8\"", static_xml::content_directory_scpd()).await;
        }
        Method::Get if req.path == "/ConnectionMgr.xml" => {
            respond_chunked(reader.into_inner(), 200, "text/xml; charset=\"utf-8\"", static_xml::connection_manager_scpd()).await;
        }
        Method::Get if req.path == "/X_MS_MediaReceiverRegistrar.xml" => {
            respond_chunked(reader.into_inner(), 200, "text/xml; charset=\"utf-8\"", static_xml::media_receiver_registrar_scpd()).await;
        }
        Method::Post if req.path.starts_with("/ctl/") => {
            serve_soap(reader, req, ctx).await;
        }
        Method::Subscribe | Method::Unsubscribe if req.path.starts_with("/evt/") => {
            serve_event(reader.into_inner(), req, ctx).await;
        }
        _ => write_status_only(reader.into_inner(), 404).await,
    }
}

async fn serve_media(stream: TcpStream, req: Request, ctx: Arc<HttpContext>) {
    let relative = req.path.strip_prefix("/MediaItems/").unwrap_or("").to_string();
    let args = MediaRequestArgs {
        relative: &relative,
        head_only: req.method == Method::Head,
        range_start: req.range_start,
        range_end: req.range_end,
        transfer_mode: req.flags.transfer_mode,
        real_time_info: req.flags.real_time_info,
        caption_requested: req.flags.caption,
        host: &ctx.our_host,
    };

    match media::prepare(&ctx.media_root, &args) {
        MediaOutcome::Status(status) => write_status_only(stream, status).await,
        MediaOutcome::Stream(prepared) => {
            {
                let mut active = ctx.active_streams.lock().unwrap();
                if *active >= ctx.max_connections {
                    drop(active);
                    write_status_only(stream, 500).await;
                    return;
                }
                *active += 1;
            }
            let std_stream = match stream.into_std() {
                Ok(s) => s,
                Err(e) => {
                    debug!("failed to hand off socket for streaming: {e}");
                    let mut active = ctx.active_streams.lock().unwrap();
                    *active = active.saturating_sub(1);
                    return;
                }
            };
            if let Err(e) = std_stream.set_nonblocking(false) {
                debug!("failed to switch socket to blocking mode: {e}");
                let mut active = ctx.active_streams.lock().unwrap();
                *active = active.saturating_sub(1);
                return;
            }
            let active_streams = ctx.active_streams.clone();
            std::thread::spawn(move || {
                media::run_transfer(std_stream, &prepared);
                let mut active = active_streams.lock().unwrap();
                *active = active.saturating_sub(1);
            });
        }
    }
}

async fn serve_soap(mut reader: BufReader<TcpStream>, req: Request, ctx: Arc<HttpContext>) {
    let body = match soap::reader::read_body(&mut reader, req.content_length.max(0) as usize, req.flags.chunked).await {
        Ok(b) => b,
        Err(e) => {
            debug!("failed reading SOAP body: {e}");
            write_status_only(reader.into_inner(), 400).await;
            return;
        }
    };

    let Some(soap_action) = req.soap_action.as_deref() else {
        write_status_only(reader.into_inner(), 400).await;
        return;
    };

    let action = soap::dispatch::action_name(soap_action);
    let fields = soap::reader::scan_body(&body);
    let outcome = soap::dispatch::dispatch(&action, &fields, &ctx.media_root, &ctx.our_host).await;

    let stream = reader.into_inner();
    match soap::dispatch::outcome_fault(&outcome) {
        None => {
            let soap::dispatch::SoapOutcome::Ok { body, .. } = outcome else { unreachable!() };
            respond_chunked(stream, 200, "text/xml; charset=\"utf-8\"", &body).await;
        }
        Some((status, fault_body)) => {
            respond_chunked(stream, status, "text/xml; charset=\"utf-8\"", &fault_body).await;
        }
    }
}

async fn serve_event(stream: TcpStream, req: Request, ctx: Arc<HttpContext>) {
    match req.method {
        Method::Subscribe => {
            let sreq = SubscribeRequest {
                path: &req.path,
                callback: req.callback.as_deref(),
                nt: req.nt.as_deref(),
                sid: req.sid.as_deref(),
                timeout_secs: req.timeout_secs,
            };
            let result = {
                let mut engine = ctx.events.lock().await;
                events::handle_subscribe(&mut engine, &sreq)
            };
            match result {
                SubscribeResult::Subscribed { sid, timeout_secs } => {
                    write_with_headers(stream, 200, &[("SID", &sid), ("TIMEOUT", &format!("Second-{timeout_secs}"))]).await;
                }
                SubscribeResult::Renewed { timeout_secs } => {
                    let sid = req.sid.clone().unwrap_or_default();
                    write_with_headers(stream, 200, &[("SID", &sid), ("TIMEOUT", &format!("Second-{timeout_secs}"))]).await;
                }
                SubscribeResult::PreconditionFailed => write_status_only(stream, 412).await,
            }
        }
        Method::Unsubscribe => {
            let Some(sid) = req.sid.clone() else {
                write_status_only(stream, 400).await;
                return;
            };
            let ok = {
                let mut engine = ctx.events.lock().await;
                engine.unsubscribe(&sid)
            };
            write_status_only(stream, if ok { 200 } else { 412 }).await;
        }
        _ => write_status_only(stream, 400).await,
    }
}
