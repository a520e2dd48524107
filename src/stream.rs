// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Live sources: the packet model, the `Opener`/`Stream` trait pair for test
//! injection, and the real RTSP implementation on top of Retina.

use std::io::{Read, Write as _};
use std::net::{TcpStream, ToSocketAddrs};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::Duration;

use base::{bail, err, Error};
use bytes::Bytes;
use futures::StreamExt;
use retina::client::Demuxed;
use retina::codec::CodecItem;
use tracing::{debug, warn};
use url::Url;

/// 90 kHz, the timescale used for all video timestamps in the pipeline.
pub const TIME_UNITS_PER_SEC: i64 = 90_000;

/// Overall limit on describe/setup/play plus the first frame.
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-frame read timeout by transport. UDP sources get longer because
/// packet loss can stall reassembly without the peer noticing.
const TCP_READ_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Limit on the preflight `OPTIONS` round trip.
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_RTSP_PORT: u16 = 554;

/// Which elementary stream a packet belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Track {
    Video,
    Audio,
}

/// A demuxed media packet. Owned by the ingest thread until handed to a sink;
/// sinks receive `&Packet` and must copy what they keep.
#[derive(Clone, Debug)]
pub struct Packet {
    pub track: Track,
    pub data: Bytes,

    /// Presentation timestamp in the track's clock units (90 kHz for video);
    /// `None` when the source omitted it (repaired before any sink sees it).
    pub pts: Option<i64>,
    pub dts: Option<i64>,

    pub is_keyframe: bool,

    /// Monotonic arrival time, stamped by the ingest thread.
    pub arrival: Duration,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A consumer of the per-stream packet sequence. Fan-out is serial: the
/// ingest thread calls each sink in turn, so sinks never see reordering.
pub trait PacketSink: Send {
    /// A short label for logs.
    fn label(&self) -> &str;

    fn write(&mut self, pkt: &Packet) -> Result<(), Error>;

    /// Flushes and closes whatever the sink has open. Called before the
    /// demuxer is torn down.
    fn finish(&mut self) -> Result<(), Error>;
}

/// Parameters of the source's video track.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoParams {
    /// A serialized ISO/IEC 14496-12 VisualSampleEntry box.
    pub sample_entry: Vec<u8>,
    pub rfc6381_codec: String,
    pub width: u16,
    pub height: u16,

    /// Advertised frame rate, when the source supplies a trustworthy one.
    pub fps: Option<u32>,
}

/// Parameters of the source's audio track.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioParams {
    /// A serialized AudioSampleEntry box.
    pub sample_entry: Vec<u8>,
    pub clock_rate: u32,
}

/// A connected, demuxed source.
pub trait Stream: Send {
    fn video_params(&self) -> &VideoParams;
    fn audio_params(&self) -> Option<&AudioParams>;

    /// Blocks for the next packet. `arrival` is stamped by the caller.
    fn next(&mut self) -> Result<Packet, Error>;
}

/// Options for opening a source.
pub struct Options {
    pub url: Url,
    pub transport: db::Transport,

    /// Whether to set up an audio track at all.
    pub want_audio: bool,

    /// Checked while blocked so teardown doesn't wait out a read timeout.
    pub shutdown_rx: base::shutdown::Receiver,
}

/// Opens a live source. This is a trait for test injection.
pub trait Opener: Send + Sync {
    /// Opens the given source.
    ///
    /// Note: despite the blocking interface, this expects to be called from
    /// the context of a multithreaded tokio runtime with IO and time enabled.
    fn open(&self, label: String, options: Options) -> Result<Box<dyn Stream>, Error>;
}

/// Returns whether the URL names an IPv4 multicast group (`224.0.0.0/4`),
/// which requires joining the group before reads.
pub fn is_multicast(url: &Url) -> bool {
    matches!(url.host(), Some(url::Host::Ipv4(a)) if a.octets()[0] & 0xf0 == 0xe0)
}

/// How a source URL gets ingested.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// Directly openable by [`RealOpener`].
    Rtsp,

    /// Raw UDP/RTP; registered with the upstream mux and re-consumed over
    /// local RTSP.
    RawUdp,
}

/// Applies the protocol allowlist and multicast validation to a source URL.
pub fn check_source_url(url: &Url) -> Result<SourceKind, Error> {
    match url.scheme() {
        "rtsp" | "rtsps" => Ok(SourceKind::Rtsp),
        "udp" | "rtp" => Ok(SourceKind::RawUdp),
        s => Err(err!(
            InvalidArgument,
            msg("scheme {s:?} is not in the protocol allowlist")
        )),
    }
}

fn read_timeout(transport: db::Transport) -> Duration {
    match transport {
        db::Transport::Tcp => TCP_READ_TIMEOUT,
        db::Transport::Udp => UDP_READ_TIMEOUT,
    }
}

/// Issues an RTSP `OPTIONS` over TCP and bails on an HTTP-404-style response,
/// so a dead or misconfigured source fails fast instead of blocking the full
/// open timeout.
pub fn preflight(url: &Url) -> Result<(), Error> {
    let host = url
        .host_str()
        .ok_or_else(|| err!(InvalidArgument, msg("source url has no host")))?;
    let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| err!(Unavailable, msg("no address for {host}:{port}")))?;
    let mut sock = TcpStream::connect_timeout(&addr, PREFLIGHT_TIMEOUT)
        .map_err(|e| err!(Unavailable, msg("connect to {addr} failed"), source(e)))?;
    sock.set_read_timeout(Some(PREFLIGHT_TIMEOUT))?;
    sock.set_write_timeout(Some(PREFLIGHT_TIMEOUT))?;
    write!(sock, "OPTIONS {url} RTSP/1.0\r\nCSeq: 1\r\n\r\n")?;
    let mut buf = [0u8; 256];
    let n = sock
        .read(&mut buf)
        .map_err(|e| err!(Unavailable, msg("no reply to OPTIONS from {addr}"), source(e)))?;
    let reply = String::from_utf8_lossy(&buf[..n]);
    let status = reply
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("");
    if status.starts_with('4') || status.starts_with('5') {
        bail!(
            Unavailable,
            msg("source at {addr} rejected OPTIONS with status {status}")
        );
    }
    Ok(())
}

/// The production opener. Holds a handle to the tokio runtime that serves
/// the RTSP client, since ingest threads are plain OS threads.
pub struct RealOpener {
    rt_handle: tokio::runtime::Handle,
}

impl RealOpener {
    pub fn new(rt_handle: tokio::runtime::Handle) -> Self {
        RealOpener { rt_handle }
    }
}

impl Opener for RealOpener {
    fn open(&self, label: String, mut options: Options) -> Result<Box<dyn Stream>, Error> {
        if check_source_url(&options.url)? != SourceKind::Rtsp {
            bail!(
                InvalidArgument,
                msg("raw udp/rtp sources must be ingested via the upstream mux")
            );
        }
        preflight(&options.url)?;

        // Retina wants credentials out-of-band rather than in the URL.
        let username = options.url.username().to_owned();
        let password = options.url.password().unwrap_or("").to_owned();
        let creds = if username.is_empty() {
            None
        } else {
            options.url.set_username("").expect("has host");
            options.url.set_password(None).expect("has host");
            Some(retina::client::Credentials { username, password })
        };

        let timeout = read_timeout(options.transport);
        let shutdown_rx = options.shutdown_rx.clone();
        let rt_handle = self.rt_handle.clone();
        let (inner, first_frame) = rt_handle
            .block_on(rt_handle.spawn(tokio::time::timeout(
                OPEN_TIMEOUT,
                RetinaStreamInner::play(label, options, creds),
            )))
            .expect("RetinaStreamInner::play task panicked, see earlier error")
            .map_err(|e| {
                err!(
                    DeadlineExceeded,
                    msg("unable to play stream and get first frame within {OPEN_TIMEOUT:?}"),
                    source(e),
                )
            })??;
        Ok(Box::new(RetinaStream {
            inner: Some(inner),
            rt_handle,
            first_frame: Some(first_frame),
            read_timeout: timeout,
            shutdown_rx,
        }))
    }
}

/// Real stream, implemented with the Retina library.
///
/// Retina is asynchronous and tokio-based where the ingest loop expects a
/// synchronous interface, so this blocks on the tokio operations via a
/// per-frame `handle.block_on(handle.spawn(...))` hand-off.
struct RetinaStream {
    /// The actual stream details used from within the tokio reactor.
    ///
    /// Spawned tokio tasks must be `'static`, so ownership is passed to the
    /// task, and then returned when it completes.
    inner: Option<Box<RetinaStreamInner>>,

    rt_handle: tokio::runtime::Handle,

    /// The first frame, if not yet returned from `next`.
    ///
    /// This frame is special because it is fetched as part of getting the
    /// video parameters.
    first_frame: Option<retina::codec::VideoFrame>,

    read_timeout: Duration,
    shutdown_rx: base::shutdown::Receiver,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
    video_params: VideoParams,
    audio_params: Option<AudioParams>,
}

fn params_to_video_params(
    params: &retina::codec::VideoParameters,
) -> Result<VideoParams, Error> {
    let (width, height) = params.pixel_dimensions();
    let width = u16::try_from(width).map_err(|e| err!(Unknown, source(e)))?;
    let height = u16::try_from(height).map_err(|e| err!(Unknown, source(e)))?;
    Ok(VideoParams {
        sample_entry: params
            .mp4_sample_entry()
            .build()
            .map_err(|e| err!(Unknown, source(e)))?,
        rfc6381_codec: params.rfc6381_codec().to_owned(),
        width,
        height,
        // RTSP sources rarely advertise a trustworthy rate; leave it unset
        // rather than record a guess.
        fps: None,
    })
}

impl RetinaStreamInner {
    /// Plays to the first frame. No timeout; that's the caller's
    /// responsibility.
    async fn play(
        label: String,
        options: Options,
        creds: Option<retina::client::Credentials>,
    ) -> Result<(Box<Self>, retina::codec::VideoFrame), Error> {
        let session_options = retina::client::SessionOptions::default()
            .creds(creds)
            .user_agent(format!("lightnvr {}", env!("CARGO_PKG_VERSION")))
            .teardown(retina::client::TeardownPolicy::Auto);
        let mut session = retina::client::Session::describe(options.url.clone(), session_options)
            .await
            .map_err(|e| err!(Unavailable, msg("DESCRIBE failed"), source(e)))?;
        debug!("connected to {:?}, tool {:?}", &label, session.tool());
        let video_i = session
            .streams()
            .iter()
            .position(|s| {
                s.media() == "video" && matches!(s.encoding_name(), "h264" | "h265" | "jpeg")
            })
            .ok_or_else(|| {
                err!(
                    FailedPrecondition,
                    msg("couldn't find supported video stream")
                )
            })?;
        let transport = match options.transport {
            db::Transport::Tcp => retina::client::Transport::Tcp(Default::default()),
            db::Transport::Udp => retina::client::Transport::Udp(Default::default()),
        };
        session
            .setup(
                video_i,
                retina::client::SetupOptions::default().transport(transport.clone()),
            )
            .await
            .map_err(|e| err!(Unavailable, msg("video SETUP failed"), source(e)))?;
        let audio_i = if options.want_audio {
            session.streams().iter().enumerate().find_map(|(i, s)| {
                match s.parameters() {
                    // Only audio that can produce a .mp4 sample entry without
                    // transcoding.
                    Some(retina::codec::ParametersRef::Audio(a))
                        if a.mp4_sample_entry().build().is_ok() =>
                    {
                        Some(i)
                    }
                    _ => None,
                }
            })
        } else {
            None
        };
        if let Some(i) = audio_i {
            session
                .setup(
                    i,
                    retina::client::SetupOptions::default().transport(transport.clone()),
                )
                .await
                .map_err(|e| err!(Unavailable, msg("audio SETUP failed"), source(e)))?;
        }
        let session = session
            .play(
                retina::client::PlayOptions::default()
                    .initial_timestamp(retina::client::InitialTimestampPolicy::Default)
                    .enforce_timestamps_with_max_jump_secs(NonZeroU32::new(10).unwrap()),
            )
            .await
            .map_err(|e| err!(Unavailable, msg("PLAY failed"), source(e)))?;
        let mut session = session.demuxed().map_err(|e| err!(Unknown, source(e)))?;

        // First frame.
        let first_frame = loop {
            match Pin::new(&mut session).next().await {
                None => bail!(Unavailable, msg("stream closed before first frame")),
                Some(Err(e)) => bail!(Unavailable, msg("unable to get first frame"), source(e)),
                Some(Ok(CodecItem::VideoFrame(v))) => {
                    if v.is_random_access_point() {
                        break v;
                    }
                }
                Some(Ok(_)) => {}
            }
        };
        let video_params = match session.streams()[video_i].parameters() {
            Some(retina::codec::ParametersRef::Video(v)) => params_to_video_params(v)?,
            _ => bail!(Unknown, msg("couldn't find video parameters")),
        };
        let audio_params = match audio_i.map(|i| session.streams()[i].parameters()) {
            Some(Some(retina::codec::ParametersRef::Audio(a))) => Some(AudioParams {
                sample_entry: a
                    .mp4_sample_entry()
                    .build()
                    .map_err(|e| err!(Unknown, source(e)))?,
                clock_rate: a.clock_rate(),
            }),
            _ => None,
        };
        let self_ = Box::new(Self {
            label,
            session,
            video_params,
            audio_params,
        });
        Ok((self_, first_frame))
    }

    /// Fetches the next video or audio frame.
    async fn fetch_next(mut self: Box<Self>) -> Result<(Box<Self>, Packet), Error> {
        loop {
            match Pin::new(&mut self.session)
                .next()
                .await
                .transpose()
                .map_err(|e| err!(Unavailable, source(e)))?
            {
                None => bail!(Unavailable, msg("end of stream")),
                Some(CodecItem::VideoFrame(v)) => {
                    if v.loss() > 0 {
                        warn!(
                            "{}: lost {} RTP packets @ {}",
                            &self.label,
                            v.loss(),
                            v.start_ctx()
                        );
                    }
                    let pts = v.timestamp().elapsed();
                    let is_keyframe = v.is_random_access_point();
                    let pkt = Packet {
                        track: Track::Video,
                        data: Bytes::from(v.into_data()),
                        pts: Some(pts),
                        dts: Some(pts),
                        is_keyframe,
                        arrival: Duration::ZERO,
                    };
                    return Ok((self, pkt));
                }
                Some(CodecItem::AudioFrame(a)) => {
                    let pts = a.timestamp().elapsed();
                    let pkt = Packet {
                        track: Track::Audio,
                        data: Bytes::from(a.data().to_vec()),
                        pts: Some(pts),
                        dts: Some(pts),
                        is_keyframe: false,
                        arrival: Duration::ZERO,
                    };
                    return Ok((self, pkt));
                }
                Some(_) => {}
            }
        }
    }
}

impl Stream for RetinaStream {
    fn video_params(&self) -> &VideoParams {
        &self.inner.as_ref().unwrap().video_params
    }

    fn audio_params(&self) -> Option<&AudioParams> {
        self.inner.as_ref().unwrap().audio_params.as_ref()
    }

    fn next(&mut self) -> Result<Packet, Error> {
        if let Some(f) = self.first_frame.take() {
            let pts = f.timestamp().elapsed();
            let is_keyframe = f.is_random_access_point();
            return Ok(Packet {
                track: Track::Video,
                data: Bytes::from(f.into_data()),
                pts: Some(pts),
                dts: Some(pts),
                is_keyframe,
                arrival: Duration::ZERO,
            });
        }
        let inner = self.inner.take().unwrap();
        let timeout = self.read_timeout;
        let shutdown = self.shutdown_rx.clone();
        let (inner, pkt) = self
            .rt_handle
            .block_on(self.rt_handle.spawn(async move {
                tokio::select! {
                    _ = shutdown.future() => {
                        Err(err!(Cancelled, msg("shutdown requested during read")))
                    }
                    r = tokio::time::timeout(timeout, inner.fetch_next()) => {
                        r.map_err(|_| {
                            err!(DeadlineExceeded, msg("no frame within {timeout:?}"))
                        })?
                    }
                }
            }))
            .expect("fetch_next task panicked, see earlier error")?;
        self.inner = Some(inner);
        debug_assert!(!pkt.is_empty());
        Ok(pkt)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist() {
        let ok = |s: &str| check_source_url(&Url::parse(s).unwrap()).unwrap();
        assert_eq!(ok("rtsp://cam/main"), SourceKind::Rtsp);
        assert_eq!(ok("rtsps://cam/main"), SourceKind::Rtsp);
        assert_eq!(ok("udp://239.0.0.1:1234"), SourceKind::RawUdp);
        assert_eq!(ok("rtp://224.1.2.3:5000"), SourceKind::RawUdp);

        let e = check_source_url(&Url::parse("http://cam/stream").unwrap()).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
        let e = check_source_url(&Url::parse("file:///etc/passwd").unwrap()).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn preflight_rejects_404() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let h = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let _ = sock.read(&mut buf);
            sock.write_all(b"RTSP/1.0 404 Stream Not Found\r\nCSeq: 1\r\n\r\n")
                .unwrap();
        });
        let url = Url::parse(&format!("rtsp://{addr}/nosuch")).unwrap();
        let e = preflight(&url).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Unavailable);
        h.join().unwrap();
    }

    #[test]
    fn preflight_accepts_200() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let h = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let _ = sock.read(&mut buf);
            sock.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: DESCRIBE, SETUP\r\n\r\n")
                .unwrap();
        });
        let url = Url::parse(&format!("rtsp://{addr}/ok")).unwrap();
        preflight(&url).unwrap();
        h.join().unwrap();
    }
}
