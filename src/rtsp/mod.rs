//! Minimal RTSP/1.0 client: one H.264 track, RTP interleaved over the control connection.

pub mod auth;
pub mod depacketizer;
pub mod message;
pub mod rtp;
pub mod sdp;

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::core::RtspError;
use auth::{Authenticator, Challenge, Credentials};
use message::{Incoming, Request, Response, parse_incoming, parse_session_header};

pub use depacketizer::{DepacketizeError, H264Depacketizer};
pub use rtp::{RtpPacket, TimestampUnwrapper};
pub use sdp::{SessionDescription, VideoMedia};

pub const DEFAULT_PORT: u16 = 554;
const READ_CHUNK: usize = 16 * 1024;
const TRANSPORT: &str = "RTP/AVP/TCP;unicast;interleaved=0-1";

/// Where and as whom to connect, split out of an `rtsp://` URL.
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub host: String,
    pub port: u16,
    /// URL used in request lines, credentials stripped.
    pub request_url: String,
    pub credentials: Option<Credentials>,
}

impl StreamTarget {
    pub fn parse(raw: &str) -> Result<Self, RtspError> {
        let invalid = |reason: &str| RtspError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "rtsp" {
            return Err(invalid("scheme must be rtsp"));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(Credentials {
                username: percent_decode(url.username()),
                password: url.password().map(percent_decode).unwrap_or_default(),
            })
        };

        url.set_username("").map_err(|_| invalid("cannot strip credentials"))?;
        url.set_password(None).map_err(|_| invalid("cannot strip credentials"))?;

        Ok(Self {
            host,
            port,
            request_url: url.to_string(),
            credentials,
        })
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// An established control connection. After [`RtspClient::start_session`] the
/// same socket carries the interleaved media.
pub struct RtspClient {
    stream: TcpStream,
    buf: BytesMut,
    target: StreamTarget,
    cseq: u32,
    auth: Option<Authenticator>,
    session: Option<String>,
    read_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_method: &'static str,
    rtp_channel: u8,
}

impl RtspClient {
    pub async fn connect(
        target: StreamTarget,
        connect_timeout: Duration,
        session_timeout: Duration,
    ) -> Result<Self, RtspError> {
        let addr = format!("{}:{}", target.host, target.port);
        let stream = timeout(connect_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| RtspError::ConnectTimeout { addr: addr.clone() })??;
        stream.set_nodelay(true)?;

        log::info!("[rtsp] connected to {}", addr);

        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            target,
            cseq: 0,
            auth: None,
            session: None,
            read_timeout: session_timeout,
            keepalive_interval: session_timeout / 2,
            keepalive_method: "OPTIONS",
            rtp_channel: 0,
        })
    }

    /// OPTIONS, DESCRIBE, SETUP and PLAY. On success media is flowing.
    pub async fn start_session(&mut self) -> Result<SessionDescription, RtspError> {
        let url = self.target.request_url.clone();

        let options = self.request("OPTIONS", &url, &[]).await?;
        if options
            .header("Public")
            .map(|p| p.contains("GET_PARAMETER"))
            .unwrap_or(false)
        {
            self.keepalive_method = "GET_PARAMETER";
        }

        let describe = self
            .request("DESCRIBE", &url, &[("Accept", "application/sdp".into())])
            .await?;
        let body = std::str::from_utf8(&describe.body)
            .map_err(|_| RtspError::MalformedSdp("body is not utf-8".into()))?;
        let sdp = sdp::parse(body)?;

        let base = describe
            .header("Content-Base")
            .or_else(|| describe.header("Content-Location"))
            .unwrap_or(&url)
            .to_string();
        let aggregate = sdp::resolve_control(&base, sdp.control.as_deref());
        let media_uri = sdp::resolve_control(&base, sdp.video.control.as_deref());

        let setup = self
            .request("SETUP", &media_uri, &[("Transport", TRANSPORT.into())])
            .await?;
        let session = setup
            .header("Session")
            .ok_or_else(|| RtspError::MalformedResponse("SETUP reply without Session".into()))?;
        let (id, server_timeout) = parse_session_header(session);
        if let Some(secs) = server_timeout.filter(|s| *s >= 2) {
            self.keepalive_interval = self.keepalive_interval.min(Duration::from_secs(secs) / 2);
        }
        self.session = Some(id);
        if let Some(channel) = setup.header("Transport").and_then(interleaved_channel) {
            self.rtp_channel = channel;
        }

        self.request("PLAY", &aggregate, &[("Range", "npt=0.000-".into())])
            .await?;

        log::info!(
            "[rtsp] playing {} (pt {}, session {})",
            media_uri,
            sdp.video.payload_type,
            self.session.as_deref().unwrap_or("-")
        );
        Ok(sdp)
    }

    /// Session id from the SETUP reply, without the timeout parameter.
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn rtp_channel(&self) -> u8 {
        self.rtp_channel
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// Next interleaved frame; control replies in between are skipped.
    /// Cancel-safe.
    pub async fn next_interleaved(&mut self) -> Result<(u8, Bytes), RtspError> {
        loop {
            match self.read_incoming().await? {
                Incoming::Interleaved { channel, payload } => return Ok((channel, payload)),
                Incoming::Response(resp) if !resp.is_success() => {
                    log::warn!("[rtsp] keep-alive answered {} {}", resp.status, resp.reason);
                }
                Incoming::Response(_) => {}
                Incoming::Request { method } => {
                    log::debug!("[rtsp] ignoring server request {}", method);
                }
            }
        }
    }

    /// Fire-and-forget keep-alive; the reply is skipped by [`Self::next_interleaved`].
    pub async fn send_keepalive(&mut self) -> Result<(), RtspError> {
        let url = self.target.request_url.clone();
        let method = self.keepalive_method;
        let req = self.prepare(method, &url, &[]);
        self.stream.write_all(&req.encode(self.cseq)).await?;
        Ok(())
    }

    /// Best-effort TEARDOWN, then closes the socket.
    pub async fn teardown(mut self) {
        if self.session.is_some() {
            let url = self.target.request_url.clone();
            let req = self.prepare("TEARDOWN", &url, &[]);
            let bytes = req.encode(self.cseq);
            match timeout(Duration::from_secs(1), self.stream.write_all(&bytes)).await {
                Ok(Ok(())) => log::info!("[rtsp] teardown sent"),
                Ok(Err(e)) => log::debug!("[rtsp] teardown failed: {}", e),
                Err(_) => log::debug!("[rtsp] teardown timed out"),
            }
        }
        let _ = self.stream.shutdown().await;
    }

    fn prepare(&mut self, method: &'static str, uri: &str, headers: &[(&str, String)]) -> Request {
        self.cseq += 1;
        let mut req = Request::new(method, uri);
        for (name, value) in headers {
            req = req.header(name, value.clone());
        }
        if let Some(session) = &self.session {
            req = req.header("Session", session.clone());
        }
        if let Some(auth) = self.auth.as_mut() {
            req = req.header("Authorization", auth.authorization(method, uri));
        }
        req
    }

    async fn request(
        &mut self,
        method: &'static str,
        uri: &str,
        headers: &[(&str, String)],
    ) -> Result<Response, RtspError> {
        let mut retried = false;
        loop {
            let req = self.prepare(method, uri, headers);
            let cseq = self.cseq;
            self.stream.write_all(&req.encode(cseq)).await?;
            let resp = self.read_response(cseq).await?;

            if resp.status == 401 {
                if retried {
                    return Err(RtspError::Unauthorized);
                }
                let credentials = self
                    .target
                    .credentials
                    .clone()
                    .ok_or(RtspError::Unauthorized)?;
                let challenge = Challenge::select(resp.headers_named("WWW-Authenticate"))?;
                log::debug!("[rtsp] {} needs authentication, retrying", method);
                self.auth = Some(Authenticator::new(credentials, challenge));
                retried = true;
                continue;
            }

            if !resp.is_success() {
                return Err(RtspError::Status {
                    method,
                    status: resp.status,
                    reason: resp.reason,
                });
            }
            return Ok(resp);
        }
    }

    async fn read_response(&mut self, cseq: u32) -> Result<Response, RtspError> {
        loop {
            match self.read_incoming().await? {
                Incoming::Response(resp) => match resp.cseq() {
                    Some(seq) if seq != cseq => {
                        log::debug!("[rtsp] skipping stale reply for CSeq {}", seq);
                    }
                    _ => return Ok(resp),
                },
                Incoming::Interleaved { .. } | Incoming::Request { .. } => {}
            }
        }
    }

    async fn read_incoming(&mut self) -> Result<Incoming, RtspError> {
        loop {
            if let Some(msg) = parse_incoming(&mut self.buf)? {
                return Ok(msg);
            }
            self.buf.reserve(READ_CHUNK);
            let n = timeout(self.read_timeout, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| RtspError::ReadTimeout(self.read_timeout))??;
            if n == 0 {
                return Err(RtspError::ConnectionClosed);
            }
        }
    }
}

/// `interleaved=2-3` in a Transport header → 2.
fn interleaved_channel(transport: &str) -> Option<u8> {
    transport
        .split(';')
        .find_map(|p| p.trim().strip_prefix("interleaved="))
        .and_then(|range| range.split('-').next())
        .and_then(|c| c.trim().parse().ok())
}
