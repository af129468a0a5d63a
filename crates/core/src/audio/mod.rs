//! Audio acquisition: bounded loading from disk or HTTP, decoding to mono
//! samples, and the [`InputSource`] seam for frame-driven sources.

use std::{
    fs::File,
    io::{Cursor, Read},
    path::Path,
    time::Duration,
};

use futures::StreamExt;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use crate::{LightSyncError, Result};

/// Mono PCM produced by [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Where an audio payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioLocation {
    Local(String),
    Remote(String),
}

impl AudioLocation {
    /// `http://` and `https://` sources are remote, anything else is a path.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Remote(raw.to_string())
        } else {
            Self::Local(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Local(path) => path,
            Self::Remote(url) => url,
        }
    }
}

/// Loads raw audio bytes from either a path or a URL, refusing anything
/// larger than `ceiling` bytes.
pub async fn load(location: &AudioLocation, ceiling: u64, fetch_timeout: Duration) -> Result<Vec<u8>> {
    match location {
        AudioLocation::Local(path) => load_local(path, ceiling),
        AudioLocation::Remote(url) => fetch_remote(url, ceiling, fetch_timeout).await,
    }
}

/// Reads a file, refusing anything larger than `ceiling` bytes.
pub fn load_local(path: impl AsRef<Path>, ceiling: u64) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)?.len();
    if size > ceiling {
        return Err(oversize_error(size, ceiling));
    }

    // The file may have grown since the metadata call.
    let bytes = read_bounded(File::open(path)?, ceiling)?;
    tracing::debug!(?path, bytes = bytes.len(), "loaded local audio");
    Ok(bytes)
}

/// Reads at most one byte past `ceiling`, enough to tell an oversized
/// source apart without buffering all of it.
fn read_bounded(reader: impl Read, ceiling: u64) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.take(ceiling.saturating_add(1)).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > ceiling {
        return Err(oversize_error(bytes.len() as u64, ceiling));
    }
    Ok(bytes)
}

/// Streams a remote payload, aborting the transfer as soon as the running
/// total passes `ceiling`, whatever `Content-Length` claimed.
pub async fn fetch_remote(url: &str, ceiling: u64, timeout: Duration) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(LightSyncError::input(format!(
            "fetching `{url}` failed with status {}",
            response.status()
        )));
    }

    if let Some(advertised) = response.content_length() {
        if advertised > ceiling {
            return Err(oversize_error(advertised, ceiling));
        }
    }

    let mut buffer = BoundedBuffer::new(ceiling);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Err(err) = buffer.extend(&chunk) {
            tracing::warn!(url, ceiling, "aborting oversized audio download");
            return Err(err);
        }
    }

    tracing::debug!(url, bytes = buffer.len(), "fetched remote audio");
    Ok(buffer.into_inner())
}

fn oversize_error(size: u64, ceiling: u64) -> LightSyncError {
    LightSyncError::input(format!(
        "audio payload of {size} bytes exceeds the {ceiling} byte limit"
    ))
}

/// Byte accumulator that refuses to grow past a ceiling.
#[derive(Debug)]
pub(crate) struct BoundedBuffer {
    bytes: Vec<u8>,
    ceiling: u64,
}

impl BoundedBuffer {
    pub(crate) fn new(ceiling: u64) -> Self {
        Self {
            bytes: Vec::new(),
            ceiling,
        }
    }

    pub(crate) fn extend(&mut self, chunk: &[u8]) -> Result<()> {
        let total = self.bytes.len() as u64 + chunk.len() as u64;
        if total > self.ceiling {
            return Err(oversize_error(total, self.ceiling));
        }
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Decodes an in-memory audio container to mono `f32` samples. Multi-channel
/// audio is averaged down to a single channel.
pub fn decode(bytes: Vec<u8>) -> Result<DecodedAudio> {
    if bytes.is_empty() {
        return Err(LightSyncError::input("audio payload is empty"));
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| LightSyncError::input(format!("unrecognised audio format: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .ok_or_else(|| LightSyncError::input("no decodable audio track found"))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| LightSyncError::input("audio track has no sample rate"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| LightSyncError::input(format!("unsupported codec: {e}")))?;

    let mut samples = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                tracing::warn!("decoder reset required, stopping early");
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(audio_buf) => {
                let spec = *audio_buf.spec();
                let channels = spec.channels.count().max(1);
                let buf = sample_buf
                    .get_or_insert_with(|| SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec));
                buf.copy_interleaved_ref(audio_buf);
                let raw = buf.samples();
                if channels > 1 {
                    samples.extend(
                        raw.chunks_exact(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                    );
                } else {
                    samples.extend_from_slice(raw);
                }
            }
            Err(SymphoniaError::DecodeError(reason)) => {
                tracing::warn!(reason, "skipping undecodable packet");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if samples.is_empty() {
        return Err(LightSyncError::input("audio payload decoded to zero samples"));
    }

    tracing::debug!(samples = samples.len(), sample_rate, "decoded audio");
    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Callback invoked with each block of mono samples an [`InputSource`]
/// produces.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Capability interface for anything that produces audio frames over time
/// (file replay today; capture devices can plug in here later).
pub trait InputSource: Send {
    fn sample_rate(&self) -> u32;

    /// Registers the frame consumer. Replaces any previous callback.
    fn on_frame(&mut self, callback: FrameCallback);

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Replays an already decoded buffer in fixed-size frames. Starting the
/// source pushes every frame through the callback synchronously.
pub struct ReplaySource {
    audio: DecodedAudio,
    frame_size: usize,
    callback: Option<FrameCallback>,
    running: bool,
}

impl ReplaySource {
    /// Replays `audio` in frames of `frame_size` samples.
    pub fn new(audio: DecodedAudio, frame_size: usize) -> Self {
        Self {
            audio,
            frame_size: frame_size.max(1),
            callback: None,
            running: false,
        }
    }
}

impl InputSource for ReplaySource {
    fn sample_rate(&self) -> u32 {
        self.audio.sample_rate
    }

    fn on_frame(&mut self, callback: FrameCallback) {
        self.callback = Some(callback);
    }

    fn start(&mut self) -> Result<()> {
        let callback = self
            .callback
            .as_mut()
            .ok_or_else(|| LightSyncError::msg("replay source started without a frame callback"))?;

        self.running = true;
        for frame in self.audio.samples.chunks(self.frame_size) {
            if !self.running {
                break;
            }
            callback(frame);
        }
        self.running = false;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl std::fmt::Debug for ReplaySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySource")
            .field("sample_rate", &self.audio.sample_rate)
            .field("samples", &self.audio.samples.len())
            .field("frame_size", &self.frame_size)
            .field("running", &self.running)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Builds a mono 16-bit PCM WAV file in memory.
    pub(crate) fn wav_bytes(samples: &[f32], sample_rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    #[test]
    fn decodes_pcm_wav() {
        let samples: Vec<f32> = (0..8_000)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();
        let decoded = decode(wav_bytes(&samples, 8_000)).unwrap();

        assert_eq!(decoded.sample_rate, 8_000);
        assert_eq!(decoded.samples.len(), samples.len());
        assert!((decoded.duration_seconds() - 1.0).abs() < 1e-3);
        assert!((decoded.samples[100] - samples[100]).abs() < 1e-3);
    }

    #[test]
    fn rejects_garbage_bytes() {
        let err = decode(b"definitely not audio".to_vec()).unwrap_err();
        assert!(matches!(err, LightSyncError::Input(_)));
        assert!(decode(Vec::new()).is_err());
    }

    #[test]
    fn bounded_buffer_stops_at_ceiling() {
        let mut buffer = BoundedBuffer::new(10);
        buffer.extend(&[0; 6]).unwrap();
        buffer.extend(&[0; 4]).unwrap();
        let err = buffer.extend(&[0; 1]).unwrap_err();

        assert!(err.to_string().contains("exceeds the 10 byte limit"));
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn local_loading_respects_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, vec![0u8; 128]).unwrap();

        assert_eq!(load_local(&path, 128).unwrap().len(), 128);
        assert!(matches!(
            load_local(&path, 127).unwrap_err(),
            LightSyncError::Input(_)
        ));
    }

    #[test]
    fn bounded_read_stops_one_byte_past_ceiling() {
        let source = Cursor::new(vec![7u8; 4_096]);
        let err = read_bounded(source, 100).unwrap_err();
        assert!(err.to_string().contains("101 bytes exceeds the 100 byte limit"), "{err}");

        assert_eq!(read_bounded(Cursor::new(vec![1u8; 100]), 100).unwrap().len(), 100);
    }

    /// Answers one HTTP request with `head` followed by `body`, then closes.
    async fn serve_once(head: String, body: Vec<u8>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/track.mp3")
    }

    fn chunked(total: usize, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in 0..total / chunk {
            out.extend_from_slice(format!("{chunk:x}\r\n").as_bytes());
            out.extend(std::iter::repeat(b'a').take(chunk));
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    #[tokio::test]
    async fn remote_fetch_aborts_chunked_body_past_ceiling() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_string(),
            chunked(512, 32),
        )
        .await;

        let err = fetch_remote(&url, 64, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, LightSyncError::Input(_)), "{err}");
    }

    #[tokio::test]
    async fn remote_fetch_rejects_understated_length_over_ceiling() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n".to_string(),
            vec![b'a'; 500],
        )
        .await;

        let err = fetch_remote(&url, 64, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, LightSyncError::Input(_)), "{err}");
    }

    #[tokio::test]
    async fn remote_fetch_never_reads_past_an_understated_length() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 16\r\nConnection: close\r\n\r\n".to_string(),
            vec![b'a'; 500],
        )
        .await;

        let bytes = fetch_remote(&url, 64, Duration::from_secs(5)).await.unwrap();
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn parses_locations() {
        assert_eq!(
            AudioLocation::parse("https://example.com/a.mp3"),
            AudioLocation::Remote("https://example.com/a.mp3".to_string())
        );
        assert_eq!(
            AudioLocation::parse("song.flac"),
            AudioLocation::Local("song.flac".to_string())
        );
    }

    #[test]
    fn replay_source_emits_fixed_frames() {
        let audio = DecodedAudio {
            samples: vec![0.25; 10],
            sample_rate: 4,
        };
        let mut source = ReplaySource::new(audio, 4);
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = sizes.clone();
        source.on_frame(Box::new(move |frame| sink.lock().unwrap().push(frame.len())));

        source.start().unwrap();

        assert_eq!(*sizes.lock().unwrap(), vec![4, 4, 2]);
        assert!(!source.is_running());
    }
}
