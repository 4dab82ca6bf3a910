//! Basic and Digest (MD5) authentication for RTSP requests.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use rand::Rng;

use crate::core::RtspError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Digest {
        realm: String,
        nonce: String,
        opaque: Option<String>,
        qop_auth: bool,
    },
}

impl Challenge {
    pub fn parse(header: &str) -> Result<Self, RtspError> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("Basic") {
            return Ok(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(RtspError::UnsupportedAuth(scheme.to_string()));
        }

        let params = parse_params(rest);
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };

        if let Some(algorithm) = get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("MD5") {
                return Err(RtspError::UnsupportedAuth(format!("Digest {}", algorithm)));
            }
        }

        let realm = get("realm").ok_or_else(|| {
            RtspError::MalformedResponse("digest challenge without realm".into())
        })?;
        let nonce = get("nonce").ok_or_else(|| {
            RtspError::MalformedResponse("digest challenge without nonce".into())
        })?;
        let qop_auth = get("qop")
            .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false);

        Ok(Challenge::Digest {
            realm,
            nonce,
            opaque: get("opaque"),
            qop_auth,
        })
    }

    /// Picks the strongest supported challenge out of all `WWW-Authenticate` headers.
    pub fn select<'a>(headers: impl Iterator<Item = &'a str>) -> Result<Self, RtspError> {
        let mut best: Option<Challenge> = None;
        let mut last_err = None;
        for header in headers {
            match Challenge::parse(header) {
                Ok(c @ Challenge::Digest { .. }) => return Ok(c),
                Ok(c) => best = Some(c),
                Err(e) => last_err = Some(e),
            }
        }
        best.ok_or_else(|| last_err.unwrap_or(RtspError::Unauthorized))
    }
}

pub struct Authenticator {
    credentials: Credentials,
    challenge: Challenge,
    nonce_count: u32,
}

impl Authenticator {
    pub fn new(credentials: Credentials, challenge: Challenge) -> Self {
        Self {
            credentials,
            challenge,
            nonce_count: 0,
        }
    }

    /// Value of the `Authorization` header for one request.
    pub fn authorization(&mut self, method: &str, uri: &str) -> String {
        match &self.challenge {
            Challenge::Basic => {
                let token = STANDARD.encode(format!(
                    "{}:{}",
                    self.credentials.username, self.credentials.password
                ));
                format!("Basic {}", token)
            }
            Challenge::Digest {
                realm,
                nonce,
                opaque,
                qop_auth,
            } => {
                let qop = if *qop_auth {
                    self.nonce_count += 1;
                    let cnonce = format!("{:016x}", rand::thread_rng().r#gen::<u64>());
                    Some((self.nonce_count, cnonce))
                } else {
                    None
                };

                let response = digest_response(
                    &self.credentials,
                    realm,
                    nonce,
                    method,
                    uri,
                    qop.as_ref().map(|(nc, cnonce)| (*nc, cnonce.as_str())),
                );

                let mut header = format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                    self.credentials.username, realm, nonce, uri, response
                );
                if let Some((nc, cnonce)) = qop {
                    header.push_str(&format!(", qop=auth, nc={:08x}, cnonce=\"{}\"", nc, cnonce));
                }
                if let Some(opaque) = opaque {
                    header.push_str(&format!(", opaque=\"{}\"", opaque));
                }
                header
            }
        }
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// RFC 2617 request digest. `qop` carries `(nc, cnonce)` when `qop=auth` is in use.
pub fn digest_response(
    credentials: &Credentials,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(u32, &str)>,
) -> String {
    let ha1 = md5_hex(&format!(
        "{}:{}:{}",
        credentials.username, realm, credentials.password
    ));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some((nc, cnonce)) => md5_hex(&format!(
            "{}:{}:{:08x}:{}:auth:{}",
            ha1, nonce, nc, cnonce, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// `key="value", key=value` pairs; commas inside quotes are kept.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim().to_string(), &after[end..]),
                None => (after.trim().to_string(), ""),
            }
        };

        params.push((key, value));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}
