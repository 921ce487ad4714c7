// Resource Scripts
// Runs a resource script: JSON request on stdin, version JSON on stdout, logs on stderr

use super::{IoConfig, MetadataField, Params, ResourceError, Source, Version};
use crate::signals::{self, CancelSignal, ReadySignal};

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Request written to the script's stdin
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScriptRequest {
    pub source: Source,
    pub params: Params,
}

/// Response the script prints on stdout
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScriptResponse {
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

/// Run a prepared command as a resource script.
///
/// A non-zero exit is reported as [`ResourceError::ScriptFailed`]; cancellation kills the
/// child and yields [`ResourceError::Interrupted`].
pub async fn run_script(
    mut cmd: Command,
    request: &ScriptRequest,
    io: &IoConfig,
    mut cancel: CancelSignal,
    ready: ReadySignal,
) -> Result<ScriptResponse, ResourceError> {
    if signals::is_cancelled(&cancel) {
        return Err(ResourceError::Interrupted);
    }

    let input = serde_json::to_vec(request)?;

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(ResourceError::Spawn)?;
    let _ = ready.send(());

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Feed the request concurrently so a script that writes before reading can't deadlock
    let stdin_handle = tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "script closed stdin early");
            }
        }
    });

    let stdout_handle = tokio::spawn(async move {
        let mut output = Vec::new();
        if let Some(mut stdout) = stdout {
            let _ = stdout.read_to_end(&mut output).await;
        }
        output
    });

    let on_stderr = io.stderr.clone();
    let stderr_handle = tokio::spawn(async move {
        let mut output = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(sink) = &on_stderr {
                    sink(&line);
                }
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&line);
            }
        }
        output
    });

    let status = tokio::select! {
        status = child.wait() => Some(status?),
        _ = signals::cancelled(&mut cancel) => None,
    };

    let Some(status) = status else {
        let _ = child.kill().await;
        stdin_handle.abort();
        return Err(ResourceError::Interrupted);
    };

    let _ = stdin_handle.await;
    let stdout = stdout_handle.await.unwrap_or_default();
    let stderr = stderr_handle.await.unwrap_or_default();

    if !status.success() {
        return Err(ResourceError::ScriptFailed {
            exit_status: status.code().unwrap_or(-1),
            stderr,
        });
    }

    if let Some(sink) = &io.stdout {
        for line in String::from_utf8_lossy(&stdout).lines() {
            sink(line);
        }
    }

    Ok(serde_json::from_slice(&stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn capture() -> (IoConfig, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let io = IoConfig {
            stdout: None,
            stderr: Some(Arc::new(move |line: &str| {
                sink.lock().unwrap().push(line.to_string());
            })),
        };
        (io, lines)
    }

    #[tokio::test]
    async fn test_script_receives_request_and_reports_version() {
        let mut request = ScriptRequest::default();
        request
            .source
            .insert("uri".to_string(), serde_json::json!("git@example.com"));

        // echo the source uri back as the version
        let cmd = sh(
            r#"read -r input; uri=$(echo "$input" | sed 's/.*"uri":"\([^"]*\)".*/\1/');
               echo "pushing" >&2;
               printf '{"version":{"ref":"%s"},"metadata":[{"name":"who","value":"me"}]}' "$uri""#,
        );
        let (io, lines) = capture();
        let (_cancel_tx, cancel) = signals::cancel_channel();
        let (ready_tx, ready_rx) = signals::ready_channel();

        let response = run_script(cmd, &request, &io, cancel, ready_tx).await.unwrap();

        assert_eq!(response.version.get("ref").map(String::as_str), Some("git@example.com"));
        assert_eq!(response.metadata[0].name, "who");
        assert_eq!(*lines.lock().unwrap(), vec!["pushing".to_string()]);
        assert!(ready_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_script_failure() {
        let (io, _) = capture();
        let (_cancel_tx, cancel) = signals::cancel_channel();
        let (ready_tx, _ready_rx) = signals::ready_channel();

        let result = run_script(
            sh("cat >/dev/null; echo nope >&2; exit 3"),
            &ScriptRequest::default(),
            &io,
            cancel,
            ready_tx,
        )
        .await;

        match result {
            Err(ResourceError::ScriptFailed {
                exit_status,
                stderr,
            }) => {
                assert_eq!(exit_status, 3);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_script() {
        let (cancel_tx, cancel) = signals::cancel_channel();
        let (ready_tx, _ready_rx) = signals::ready_channel();

        let run = tokio::spawn(async move {
            run_script(
                sh("sleep 30"),
                &ScriptRequest::default(),
                &IoConfig::default(),
                cancel,
                ready_tx,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send_replace(true);

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("script is killed")
            .unwrap();
        assert!(matches!(result, Err(ResourceError::Interrupted)));
    }

    #[tokio::test]
    async fn test_garbage_output_is_invalid_response() {
        let (_cancel_tx, cancel) = signals::cancel_channel();
        let (ready_tx, _ready_rx) = signals::ready_channel();

        let result = run_script(
            sh("cat >/dev/null; echo not-json"),
            &ScriptRequest::default(),
            &IoConfig::default(),
            cancel,
            ready_tx,
        )
        .await;

        assert!(matches!(result, Err(ResourceError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let (_cancel_tx, cancel) = signals::cancel_channel();
        let (ready_tx, _ready_rx) = signals::ready_channel();

        let result = run_script(
            Command::new("/nonexistent/opt/resource/out"),
            &ScriptRequest::default(),
            &IoConfig::default(),
            cancel,
            ready_tx,
        )
        .await;

        assert!(matches!(result, Err(ResourceError::Spawn(_))));
    }
}
