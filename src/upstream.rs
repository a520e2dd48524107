// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Client for the upstream RTSP mux (go2rtc) HTTP API on localhost.
//!
//! Raw UDP/RTP sources are registered here and re-consumed over the mux's
//! local RTSP endpoint. The `DELETE` endpoint has two known shapes; the
//! query-parameter form is tried first, then the legacy path form on any
//! non-200.

use std::fmt::Write as _;
use std::time::Duration;

use base::{bail, err, Error};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:1984";

const TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Form-style URL encoding: `A–Z a–z 0–9 - _ . ~` pass through, space
/// becomes `+`, everything else `%HH`.
pub fn form_urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => {
                let _ = write!(out, "%{b:02X}");
            }
        }
    }
    out
}

/// Extracts the port from the server-info `rtsp.listen` value, which has
/// the form `":8554"` (possibly with a host prefix).
pub fn parse_listen_port(listen: &str) -> Option<u16> {
    listen.rsplit(':').next()?.parse().ok()
}

pub struct UpstreamClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl UpstreamClient {
    pub fn new(base: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(TOTAL_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(wrap)?;
        Ok(UpstreamClient {
            base: base.into(),
            http,
        })
    }

    /// Registers a source under the given stream id.
    pub fn add_stream(&self, name: &str, src: &str) -> Result<(), Error> {
        let url = format!(
            "{}/api/streams?src={}&name={}",
            self.base,
            form_urlencode(src),
            form_urlencode(name)
        );
        let resp = self.http.put(&url).send().map_err(wrap)?;
        if !resp.status().is_success() {
            bail!(
                Unavailable,
                msg("upstream mux rejected stream {name:?}: {}", resp.status())
            );
        }
        Ok(())
    }

    /// Removes a stream, falling back to the legacy path-form endpoint.
    pub fn remove_stream(&self, name: &str) -> Result<(), Error> {
        let url = format!("{}/api/streams?src={}", self.base, form_urlencode(name));
        let resp = self.http.delete(&url).send().map_err(wrap)?;
        if resp.status().as_u16() == 200 {
            return Ok(());
        }
        let legacy = format!("{}/api/streams/{}", self.base, form_urlencode(name));
        let resp = self.http.delete(&legacy).send().map_err(wrap)?;
        if !resp.status().is_success() {
            bail!(
                Unavailable,
                msg("upstream mux kept stream {name:?}: {}", resp.status())
            );
        }
        Ok(())
    }

    /// Whether the mux knows the given stream id.
    pub fn stream_exists(&self, name: &str) -> Result<bool, Error> {
        let url = format!("{}/api/streams", self.base);
        let resp = self
            .http
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(wrap)?;
        let v: serde_json::Value = resp.json().map_err(wrap)?;
        Ok(v.as_object().is_some_and(|m| m.contains_key(name)))
    }

    /// The mux's local RTSP port, parsed from server info.
    pub fn rtsp_port(&self) -> Result<u16, Error> {
        let url = format!("{}/api", self.base);
        let resp = self
            .http
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(wrap)?;
        let v: serde_json::Value = resp.json().map_err(wrap)?;
        v.pointer("/rtsp/listen")
            .and_then(|l| l.as_str())
            .and_then(parse_listen_port)
            .ok_or_else(|| err!(FailedPrecondition, msg("upstream mux has no rtsp listener")))
    }

    /// The local RTSP URL to ingest a registered stream from.
    pub fn local_rtsp_url(&self, name: &str) -> Result<String, Error> {
        Ok(format!(
            "rtsp://127.0.0.1:{}/{}",
            self.rtsp_port()?,
            form_urlencode(name)
        ))
    }

    /// Keeps the mux producing a stream even with no other consumer.
    pub fn preload(&self, name: &str) -> Result<(), Error> {
        let url = format!(
            "{}/api/preload?src={}&video&audio",
            self.base,
            form_urlencode(name)
        );
        let resp = self.http.put(&url).send().map_err(wrap)?;
        if !resp.status().is_success() {
            bail!(
                Unavailable,
                msg("upstream mux preload for {name:?} failed: {}", resp.status())
            );
        }
        Ok(())
    }
}

fn wrap(e: reqwest::Error) -> Error {
    err!(Unavailable, msg("upstream mux request failed"), source(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;

    #[test]
    fn urlencode_rules() {
        assert_eq!(form_urlencode("AZaz09-_.~"), "AZaz09-_.~");
        assert_eq!(form_urlencode("a b"), "a+b");
        assert_eq!(
            form_urlencode("rtsp://user:p@ss/cam?x=1"),
            "rtsp%3A%2F%2Fuser%3Ap%40ss%2Fcam%3Fx%3D1"
        );
        // Non-ASCII goes byte-by-byte, uppercase hex.
        assert_eq!(form_urlencode("café"), "caf%C3%A9");
    }

    #[test]
    fn listen_port_parsing() {
        assert_eq!(parse_listen_port(":8554"), Some(8554));
        assert_eq!(parse_listen_port("0.0.0.0:8554"), Some(8554));
        assert_eq!(parse_listen_port(""), None);
        assert_eq!(parse_listen_port(":notaport"), None);
    }

    /// Serves one canned HTTP response per expected request, recording the
    /// request lines.
    fn http_server(
        responses: Vec<&'static str>,
    ) -> (
        String,
        std::thread::JoinHandle<Vec<String>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let h = std::thread::spawn(move || {
            let mut request_lines = Vec::new();
            for body in responses {
                let (mut sock, _) = listener.accept().unwrap();
                let mut buf = [0u8; 2048];
                let n = sock.read(&mut buf).unwrap();
                let req = String::from_utf8_lossy(&buf[..n]).into_owned();
                request_lines.push(req.lines().next().unwrap_or("").to_owned());
                let _ = sock.write_all(body.as_bytes());
            }
            request_lines
        });
        (format!("http://{addr}"), h)
    }

    fn response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn rtsp_port_from_server_info() {
        let resp = response("200 OK", r#"{"rtsp":{"listen":":8554"}}"#);
        let resp: &'static str = Box::leak(resp.into_boxed_str());
        let (base, h) = http_server(vec![resp]);
        let c = UpstreamClient::new(base).unwrap();
        assert_eq!(c.rtsp_port().unwrap(), 8554);
        let reqs = h.join().unwrap();
        assert!(reqs[0].starts_with("GET /api HTTP/1.1"));
    }

    #[test]
    fn delete_falls_back_to_legacy_path() {
        let not_found = response("404 Not Found", "{}");
        let ok = response("200 OK", "{}");
        let (base, h) = http_server(vec![
            Box::leak(not_found.into_boxed_str()),
            Box::leak(ok.into_boxed_str()),
        ]);
        let c = UpstreamClient::new(base).unwrap();
        c.remove_stream("cam 1").unwrap();
        let reqs = h.join().unwrap();
        assert!(reqs[0].starts_with("DELETE /api/streams?src=cam+1 "));
        assert!(reqs[1].starts_with("DELETE /api/streams/cam+1 "));
    }

    #[test]
    fn existence_check_reads_json_map() {
        let body = r#"{"front":{"producers":[]},"back":{"producers":[]}}"#;
        let ok = response("200 OK", body);
        let ok2 = response("200 OK", body);
        let (base, h) = http_server(vec![
            Box::leak(ok.into_boxed_str()),
            Box::leak(ok2.into_boxed_str()),
        ]);
        let c = UpstreamClient::new(base).unwrap();
        assert!(c.stream_exists("front").unwrap());
        assert!(!c.stream_exists("side").unwrap());
        h.join().unwrap();
    }
}
