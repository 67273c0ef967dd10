//! External tool invocation.
//!
//! Track extraction shells out to the `flac` binary twice: once decoding
//! the album's sample range to raw PCM on stdout, once encoding raw PCM
//! from stdin into a fresh FLAC stream. The decoder's stdout is wired
//! directly into the encoder's stdin so the PCM never lands on disk.
//! Both stderr streams are collected and surface in the error on a
//! non-zero exit. A wall-clock timeout kills the whole pipeline.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::tags::TagMap;

/// Cap on the stderr excerpt carried inside errors.
const STDERR_EXCERPT_LEN: usize = 2048;

/// Failure while assembling a track, tagged with the pipeline stage.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("decoder exited with {status}: {stderr}")]
    Decode { status: ExitStatus, stderr: String },

    #[error("encoder exited with {status}: {stderr}")]
    Encode { status: ExitStatus, stderr: String },

    #[error("materialization timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error while assembling track: {0}")]
    Io(#[from] std::io::Error),
}

impl MaterializeError {
    /// The pipeline stage the failure belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            MaterializeError::Spawn { .. } => "spawn",
            MaterializeError::Decode { .. } => "decode",
            MaterializeError::Encode { .. } => "encode",
            MaterializeError::Timeout(_) => "timeout",
            MaterializeError::Io(_) => "io",
        }
    }
}

/// Configuration of the external decode/encode tools.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    flac_bin: PathBuf,
    timeout: Duration,
}

impl ToolSpec {
    pub fn new(flac_bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            flac_bin: flac_bin.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Decoder invocation: raw little-endian signed PCM of the sample
    /// range `[start, end)` on stdout. `--skip`/`--until` take absolute
    /// sample numbers, so the range is sample-exact.
    pub fn decode_command(&self, album: &Path, start: u64, end: u64) -> Command {
        let mut cmd = Command::new(&self.flac_bin);
        cmd.arg("-d")
            .arg("--silent")
            .arg("--stdout")
            .arg("--force-raw-format")
            .arg("--endian=little")
            .arg("--sign=signed")
            .arg(format!("--skip={start}"))
            .arg(format!("--until={end}"))
            .arg(album);
        cmd
    }

    /// Encoder invocation: raw PCM on stdin, complete FLAC stream on
    /// stdout, with the synthesized tags and optional cover art attached.
    pub fn encode_command(
        &self,
        sample_rate: u32,
        channels: u8,
        bits_per_sample: u8,
        tags: &TagMap,
        picture: Option<&Path>,
    ) -> Command {
        let mut cmd = Command::new(&self.flac_bin);
        cmd.arg("--silent")
            .arg("--stdout")
            .arg("--fast")
            .arg("--force-raw-format")
            .arg("--endian=little")
            .arg("--sign=signed")
            .arg(format!("--channels={channels}"))
            .arg(format!("--bps={bits_per_sample}"))
            .arg(format!("--sample-rate={sample_rate}"));
        for (key, value) in tags.iter() {
            cmd.arg(format!("--tag={key}={value}"));
        }
        if let Some(picture) = picture {
            cmd.arg(format!("--picture={}", picture.display()));
        }
        cmd.arg("-");
        cmd
    }
}

/// Run decoder and encoder as a streamed pipeline and collect the
/// encoder's stdout.
pub async fn run_pipeline(
    mut decoder: Command,
    mut encoder: Command,
    timeout: Duration,
) -> Result<Vec<u8>, MaterializeError> {
    let mut dec = decoder
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| MaterializeError::Spawn {
            tool: "decoder",
            source,
        })?;
    let dec_stdout = dec.stdout.take().expect("decoder stdout is piped");
    let enc_stdin: Stdio = dec_stdout.try_into()?;

    let mut enc = encoder
        .stdin(enc_stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| MaterializeError::Spawn {
            tool: "encoder",
            source,
        })?;

    match tokio::time::timeout(timeout, drive_pipeline(&mut dec, &mut enc)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(timeout = ?timeout, "pipeline exceeded deadline, killing children");
            let _ = dec.start_kill();
            let _ = enc.start_kill();
            Err(MaterializeError::Timeout(timeout))
        }
    }
}

async fn drive_pipeline(dec: &mut Child, enc: &mut Child) -> Result<Vec<u8>, MaterializeError> {
    let mut dec_stderr = dec.stderr.take().expect("decoder stderr is piped");
    let mut enc_stdout = enc.stdout.take().expect("encoder stdout is piped");
    let mut enc_stderr = enc.stderr.take().expect("encoder stderr is piped");

    let mut flac_bytes = Vec::new();
    let mut dec_err = Vec::new();
    let mut enc_err = Vec::new();

    // All three streams must drain concurrently or a full pipe buffer
    // deadlocks the children.
    let (out_res, dec_res, enc_res) = tokio::join!(
        enc_stdout.read_to_end(&mut flac_bytes),
        dec_stderr.read_to_end(&mut dec_err),
        enc_stderr.read_to_end(&mut enc_err),
    );
    out_res?;
    dec_res?;
    enc_res?;

    let dec_status = dec.wait().await?;
    let enc_status = enc.wait().await?;

    if !dec_status.success() {
        return Err(MaterializeError::Decode {
            status: dec_status,
            stderr: excerpt(&dec_err),
        });
    }
    if !enc_status.success() {
        return Err(MaterializeError::Encode {
            status: enc_status,
            stderr: excerpt(&enc_err),
        });
    }
    Ok(flac_bytes)
}

/// Run the encoder alone, feeding it PCM that was produced in-process
/// (the WAVE path, where the album file already is raw PCM).
pub async fn run_encoder_with_input(
    mut encoder: Command,
    pcm: Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>, MaterializeError> {
    let mut enc = encoder
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| MaterializeError::Spawn {
            tool: "encoder",
            source,
        })?;

    match tokio::time::timeout(timeout, drive_encoder(&mut enc, pcm)).await {
        Ok(result) => result,
        Err(_) => {
            let _ = enc.start_kill();
            Err(MaterializeError::Timeout(timeout))
        }
    }
}

async fn drive_encoder(enc: &mut Child, pcm: Vec<u8>) -> Result<Vec<u8>, MaterializeError> {
    let mut stdin = enc.stdin.take().expect("encoder stdin is piped");
    let mut stdout = enc.stdout.take().expect("encoder stdout is piped");
    let mut stderr = enc.stderr.take().expect("encoder stderr is piped");

    let mut flac_bytes = Vec::new();
    let mut err_bytes = Vec::new();

    let write = async {
        let result = stdin.write_all(&pcm).await;
        // Closing stdin signals end of input; an early encoder exit shows
        // up as a broken pipe here and is judged by the exit status below.
        drop(stdin);
        result
    };
    let (write_res, out_res, err_res) = tokio::join!(
        write,
        stdout.read_to_end(&mut flac_bytes),
        stderr.read_to_end(&mut err_bytes),
    );
    out_res?;
    err_res?;

    let status = enc.wait().await?;
    if !status.success() {
        return Err(MaterializeError::Encode {
            status,
            stderr: excerpt(&err_bytes),
        });
    }
    write_res?;
    Ok(flac_bytes)
}

fn excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_EXCERPT_LEN {
        trimmed.to_string()
    } else {
        let mut end = STDERR_EXCERPT_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        trimmed[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    // ========================================================================
    // Command assembly
    // ========================================================================

    #[test]
    fn test_decode_command_arguments() {
        let spec = ToolSpec::new("flac", Duration::from_secs(60));
        let cmd = spec.decode_command(Path::new("/music/a.flac"), 44100, 88200);
        let args = args_of(&cmd);

        assert!(args.contains(&"-d".to_string()));
        assert!(args.contains(&"--skip=44100".to_string()));
        assert!(args.contains(&"--until=88200".to_string()));
        assert!(args.contains(&"/music/a.flac".to_string()));
        assert_eq!(cmd.as_std().get_program(), "flac");
    }

    #[test]
    fn test_encode_command_arguments() {
        let spec = ToolSpec::new("/opt/bin/flac", Duration::from_secs(60));
        let mut tags = TagMap::new();
        tags.append("ARTIST", "Bob");
        tags.append("ARTIST", "Carol");
        let cmd = spec.encode_command(44100, 2, 16, &tags, Some(Path::new("/tmp/cover.jpg")));
        let args = args_of(&cmd);

        assert!(args.contains(&"--channels=2".to_string()));
        assert!(args.contains(&"--bps=16".to_string()));
        assert!(args.contains(&"--sample-rate=44100".to_string()));
        assert!(args.contains(&"--tag=ARTIST=Bob".to_string()));
        assert!(args.contains(&"--tag=ARTIST=Carol".to_string()));
        assert!(args.contains(&"--picture=/tmp/cover.jpg".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    // ========================================================================
    // Pipeline execution (exercised with shell stand-ins)
    // ========================================================================

    #[tokio::test]
    async fn test_pipeline_streams_decoder_into_encoder() {
        let out = run_pipeline(
            sh("printf 'raw-pcm-bytes'"),
            sh("tr 'a-z' 'A-Z'"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(out, b"RAW-PCM-BYTES");
    }

    #[tokio::test]
    async fn test_pipeline_decoder_failure_carries_stderr() {
        let err = run_pipeline(
            sh("echo 'no such file' >&2; exit 2"),
            sh("cat"),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        match err {
            MaterializeError::Decode { stderr, .. } => assert_eq!(stderr, "no such file"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pipeline_encoder_failure_carries_stderr() {
        let err = run_pipeline(
            sh("printf 'x'"),
            sh("echo 'bad stream' >&2; exit 3"),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        match err {
            MaterializeError::Encode { stderr, .. } => assert_eq!(stderr, "bad stream"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pipeline_timeout_kills_children() {
        let err = run_pipeline(
            sh("sleep 30"),
            sh("cat"),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MaterializeError::Timeout(_)));
        assert_eq!(err.stage(), "timeout");
    }

    #[tokio::test]
    async fn test_encoder_with_input_round_trips() {
        let out = run_encoder_with_input(sh("cat"), b"pcm".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out, b"pcm");
    }

    #[tokio::test]
    async fn test_encoder_with_input_failure() {
        let err = run_encoder_with_input(
            sh("echo nope >&2; exit 1"),
            b"pcm".to_vec(),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MaterializeError::Encode { .. }));
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "x".repeat(5000);
        assert_eq!(excerpt(long.as_bytes()).len(), STDERR_EXCERPT_LEN);
        assert_eq!(excerpt(b"  short \n"), "short");
    }
}
