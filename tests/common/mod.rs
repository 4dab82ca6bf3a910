#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use sscs_node::codec::{NaluType, split_annex_b};
use sscs_node::container::mpegts::{PAT_PID, PMT_PID, TS_PACKET_SIZE, VIDEO_PID};

// Baseline 640x480, pic_order_cnt_type 2 (decode order == display order).
pub const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xDA, 0x02, 0x80, 0xF6, 0x40];
pub const PPS: &[u8] = &[0x68, 0xC8];
pub const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x0A, 0xBC, 0xD8];
pub const P_SLICE: &[u8] = &[0x41, 0x9A, 0x00, 0x55, 0xE6, 0xC0];
pub const AUD: &[u8] = &[0x09, 0xF0];

pub fn nalu(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(data)
}

pub fn key_unit() -> Vec<Bytes> {
    vec![nalu(SPS), nalu(PPS), nalu(IDR)]
}

pub fn delta_unit() -> Vec<Bytes> {
    vec![nalu(P_SLICE)]
}

/* =========================
   MPEG-TS READING
   ========================= */

/// One video PES of a chunk file.
#[derive(Debug)]
pub struct Pes {
    pub random_access: bool,
    pub units: Vec<Vec<u8>>,
}

impl Pes {
    pub fn types(&self) -> Vec<NaluType> {
        self.units.iter().map(|u| NaluType::of(u)).collect()
    }
}

pub fn packet_pids(data: &[u8]) -> Vec<u16> {
    data.chunks(TS_PACKET_SIZE)
        .map(|p| (((p[1] & 0x1F) as u16) << 8) | p[2] as u16)
        .collect()
}

/// Reassembles the video PES packets of a transport stream.
pub fn read_video_pes(path: &Path) -> Vec<Pes> {
    let data = std::fs::read(path).unwrap();
    assert_eq!(data.len() % TS_PACKET_SIZE, 0, "{} is not packet aligned", path.display());

    let mut out: Vec<(bool, Vec<u8>)> = Vec::new();
    for p in data.chunks(TS_PACKET_SIZE) {
        assert_eq!(p[0], 0x47);
        let pid = (((p[1] & 0x1F) as u16) << 8) | p[2] as u16;
        if pid != VIDEO_PID {
            assert!(pid == PAT_PID || pid == PMT_PID, "unexpected pid {:#x}", pid);
            continue;
        }
        let unit_start = p[1] & 0x40 != 0;
        let has_af = p[3] & 0x20 != 0;
        let mut pos = 4;
        let mut random_access = false;
        if has_af {
            let len = p[4] as usize;
            if len > 0 {
                random_access = p[5] & 0x40 != 0;
            }
            pos += 1 + len;
        }
        if unit_start {
            out.push((random_access, Vec::new()));
        }
        if let Some((_, buf)) = out.last_mut() {
            buf.extend_from_slice(&p[pos..]);
        }
    }

    out.into_iter()
        .map(|(random_access, pes)| {
            assert_eq!(&pes[..3], &[0, 0, 1]);
            let header_len = pes[8] as usize;
            let es = &pes[9 + header_len..];
            Pes {
                random_access,
                units: split_annex_b(es).into_iter().map(|u| u.to_vec()).collect(),
            }
        })
        .collect()
}

/* =========================
   FAKE CAMERA
   ========================= */

pub fn rtp(pt: u8, marker: bool, seq: u16, ts: u32, payload: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(12 + payload.len());
    p.push(0x80);
    p.push((if marker { 0x80 } else { 0x00 }) | pt);
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&ts.to_be_bytes());
    p.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    p.extend_from_slice(payload);
    p
}

fn interleaved(channel: u8, packet: &[u8]) -> Vec<u8> {
    let mut out = vec![b'$', channel];
    out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    out.extend_from_slice(packet);
    out
}

#[derive(Debug, Clone, Copy)]
pub struct CameraScript {
    /// Delta frames after the leading key frame.
    pub delta_frames: u32,
    /// Hang up once all frames are sent instead of waiting for TEARDOWN.
    pub hang_up: bool,
}

/// Single-connection RTSP server streaming one key frame and some delta frames.
pub struct FakeCamera {
    port: u16,
    methods: Arc<Mutex<Vec<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeCamera {
    pub fn spawn(script: CameraScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let methods = Arc::new(Mutex::new(Vec::new()));
        let seen = methods.clone();

        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream, port, script, seen);
        });

        Self {
            port,
            methods,
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("rtsp://127.0.0.1:{}/live", self.port)
    }

    /// Waits for the connection to end and returns the request methods seen.
    pub fn finish(mut self) -> Vec<String> {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
        self.methods.lock().unwrap().clone()
    }
}

fn sdp() -> String {
    format!(
        "v=0\r\n\
         o=- 0 0 IN IP4 127.0.0.1\r\n\
         s=fake\r\n\
         t=0 0\r\n\
         a=control:*\r\n\
         m=video 0 RTP/AVP 96\r\n\
         a=rtpmap:96 H264/90000\r\n\
         a=fmtp:96 packetization-mode=1;sprop-parameter-sets={},{}\r\n\
         a=control:trackID=0\r\n",
        STANDARD.encode(SPS),
        STANDARD.encode(PPS)
    )
}

/// Reads one request head; `None` on EOF.
fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<(String, u32)> {
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            buf.drain(..end + 4);
            let method = head.split_whitespace().next().unwrap_or_default().to_string();
            let cseq = head
                .lines()
                .find_map(|l| l.strip_prefix("CSeq:"))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            return Some((method, cseq));
        }
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn reply(stream: &mut TcpStream, cseq: u32, headers: &str, body: &str) {
    let msg = format!(
        "RTSP/1.0 200 OK\r\nCSeq: {}\r\n{}Content-Length: {}\r\n\r\n{}",
        cseq,
        headers,
        body.len(),
        body
    );
    stream.write_all(msg.as_bytes()).unwrap();
}

fn serve(mut stream: TcpStream, port: u16, script: CameraScript, seen: Arc<Mutex<Vec<String>>>) {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut buf = Vec::new();

    while let Some((method, cseq)) = read_request(&mut stream, &mut buf) {
        seen.lock().unwrap().push(method.clone());
        match method.as_str() {
            "OPTIONS" => reply(
                &mut stream,
                cseq,
                "Public: OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER\r\n",
                "",
            ),
            "DESCRIBE" => reply(
                &mut stream,
                cseq,
                &format!(
                    "Content-Base: rtsp://127.0.0.1:{}/live/\r\nContent-Type: application/sdp\r\n",
                    port
                ),
                &sdp(),
            ),
            "SETUP" => reply(
                &mut stream,
                cseq,
                "Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\nSession: 5EC7A1;timeout=60\r\n",
                "",
            ),
            "PLAY" => {
                reply(&mut stream, cseq, "Session: 5EC7A1\r\n", "");
                stream_frames(&mut stream, script.delta_frames);
                if script.hang_up {
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            }
            "TEARDOWN" => {
                reply(&mut stream, cseq, "Session: 5EC7A1\r\n", "");
                return;
            }
            _ => reply(&mut stream, cseq, "", ""),
        }
    }
}

fn stream_frames(stream: &mut TcpStream, delta_frames: u32) {
    let mut seq = 1000u16;
    let mut ts = 90_000u32;
    let mut send = |stream: &mut TcpStream, marker: bool, ts: u32, payload: &[u8]| {
        let packet = rtp(96, marker, seq, ts, payload);
        seq = seq.wrapping_add(1);
        stream.write_all(&interleaved(0, &packet)).unwrap();
    };

    send(stream, false, ts, SPS);
    send(stream, false, ts, PPS);
    send(stream, true, ts, IDR);
    for _ in 0..delta_frames {
        ts = ts.wrapping_add(3600);
        send(stream, true, ts, P_SLICE);
        std::thread::sleep(Duration::from_millis(5));
    }
}
