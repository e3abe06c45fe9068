//! `Converter` backed by an external QR engine command.
//!
//! The engine is invoked twice per document inside a private temp dir:
//!
//! 1. `<cmd> scan <input.pdf>` prints a JSON array of decoded QR strings.
//! 2. `<cmd> render <output.pdf>` reads a JSON array of
//!    `{ "payment": ..., "epc_payload": "..." }` on stdin and writes the PDF.
//!
//! UPN parsing and EPC payload building happen here, between the two steps.

use std::ffi::OsStr;
use std::process::Stdio;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tracing::debug;

use crate::config::ConverterConfig;
use crate::error::ConversionError;
use crate::pipeline::convert::{Conversion, Converter};
use crate::pipeline::epc::build_epc_payload;
use crate::pipeline::types::Payment;
use crate::pipeline::upn::parse_upn_payloads;

#[derive(Serialize)]
struct RenderItem<'a> {
    payment: &'a Payment,
    epc_payload: String,
}

/// Runs the configured engine as a subprocess.
///
/// `convert` blocks on the given runtime handle, so it must be called from a
/// blocking thread (e.g. inside `spawn_blocking`), never from async code.
pub struct CommandConverter {
    config: ConverterConfig,
    runtime: Handle,
}

impl CommandConverter {
    pub fn new(config: ConverterConfig, runtime: Handle) -> Self {
        Self { config, runtime }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.config.program.as_str())
            .chain(self.config.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run one engine step and return its stdout.
    fn run_step(
        &self,
        step: &'static str,
        path: &OsStr,
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, ConversionError> {
        let timeout = self.config.timeout;
        self.runtime.block_on(async {
            let mut child = tokio::process::Command::new(&self.config.program)
                .args(&self.config.args)
                .arg(step)
                .arg(path)
                .stdin(if stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| ConversionError::Spawn {
                    command: self.command_line(),
                    source,
                })?;

            let pipe = child.stdin.take();
            let feed = async move {
                if let (Some(mut pipe), Some(input)) = (pipe, stdin) {
                    pipe.write_all(&input).await?;
                    pipe.shutdown().await?;
                }
                Ok::<(), std::io::Error>(())
            };

            let (fed, output) =
                tokio::time::timeout(timeout, async { tokio::join!(feed, child.wait_with_output()) })
                    .await
                    .map_err(|_| ConversionError::Timeout { step, timeout })?;
            let output = output?;

            if !output.status.success() {
                return Err(ConversionError::ExitStatus {
                    step,
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            fed?;
            Ok(output.stdout)
        })
    }
}

impl Converter for CommandConverter {
    fn name(&self) -> &str {
        &self.config.program
    }

    fn convert(&self, pdf: &[u8]) -> Result<Conversion, ConversionError> {
        let workdir = tempfile::Builder::new().prefix("epc-mailer-").tempdir()?;
        let input = workdir.path().join("input.pdf");
        std::fs::write(&input, pdf)?;

        let scanned = self.run_step("scan", input.as_os_str(), None)?;
        let codes: Vec<String> = serde_json::from_slice(&scanned).map_err(|e| {
            ConversionError::InvalidOutput(format!("scan output is not a JSON string array: {e}"))
        })?;

        let payments = parse_upn_payloads(&codes);
        if payments.is_empty() {
            debug!(codes = codes.len(), "No UPN payloads among decoded QR codes");
            return Ok(Conversion::NoCodesFound);
        }

        let items: Vec<RenderItem<'_>> = payments
            .iter()
            .map(|payment| RenderItem {
                payment,
                epc_payload: build_epc_payload(payment),
            })
            .collect();
        let request = serde_json::to_vec(&items)
            .map_err(|e| ConversionError::InvalidOutput(format!("render request: {e}")))?;

        let output = workdir.path().join("output.pdf");
        self.run_step("render", output.as_os_str(), Some(request))?;

        let converted = std::fs::read(&output).map_err(|e| {
            ConversionError::InvalidOutput(format!("render wrote no output file: {e}"))
        })?;
        if converted.is_empty() {
            return Err(ConversionError::InvalidOutput(
                "render wrote an empty file".into(),
            ));
        }

        Ok(Conversion::Converted {
            pdf: converted,
            payments,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::pipeline::upn::tests::upn_payload;

    const ENGINE: &str = r#"
here=$(dirname "$0")
case "$1" in
  scan) cat "$here/codes.json" ;;
  render) cat > "$2" ;;
  *) echo "unknown step $1" >&2; exit 2 ;;
esac
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        runtime: tokio::runtime::Runtime,
    }

    impl Fixture {
        fn new(script: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("engine.sh"), script).unwrap();
            Self {
                dir,
                runtime: tokio::runtime::Runtime::new().unwrap(),
            }
        }

        fn codes(&self, codes: &[String]) {
            std::fs::write(
                self.dir.path().join("codes.json"),
                serde_json::to_vec(codes).unwrap(),
            )
            .unwrap();
        }

        fn converter(&self, timeout: Duration) -> CommandConverter {
            let script: &Path = &self.dir.path().join("engine.sh");
            CommandConverter::new(
                ConverterConfig {
                    program: "sh".into(),
                    args: vec![script.to_string_lossy().into_owned()],
                    timeout,
                },
                self.runtime.handle().clone(),
            )
        }
    }

    #[test]
    fn scan_then_render_produces_converted_pdf() {
        let fx = Fixture::new(ENGINE);
        fx.codes(&[
            "not a payment".to_string(),
            upn_payload(2874, "SI56011006000001234", "SI121234", "Elektro"),
        ]);

        match fx.converter(Duration::from_secs(10)).convert(b"%PDF-1.4").unwrap() {
            Conversion::Converted { pdf, payments } => {
                assert_eq!(payments.len(), 1);
                assert_eq!(payments[0].recipient_name, "Elektro");
                let rendered: serde_json::Value = serde_json::from_slice(&pdf).unwrap();
                let epc = rendered[0]["epc_payload"].as_str().unwrap();
                assert!(epc.starts_with("BCD\n002\n1\nSCT\n"));
                assert!(epc.contains("EUR28.74"));
                assert_eq!(rendered[0]["payment"]["amount"], "28.74");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn no_upn_codes_means_no_codes_found() {
        let fx = Fixture::new(ENGINE);
        fx.codes(&["https://example.com".to_string()]);
        assert_eq!(
            fx.converter(Duration::from_secs(10)).convert(b"%PDF").unwrap(),
            Conversion::NoCodesFound
        );
    }

    #[test]
    fn failing_scan_reports_exit_status() {
        let fx = Fixture::new(ENGINE);
        // no codes.json → cat fails
        let err = fx.converter(Duration::from_secs(10)).convert(b"%PDF").unwrap_err();
        assert!(matches!(err, ConversionError::ExitStatus { step: "scan", .. }));
    }

    #[test]
    fn garbage_scan_output_is_invalid() {
        let fx = Fixture::new("echo not-json\n");
        let err = fx.converter(Duration::from_secs(10)).convert(b"%PDF").unwrap_err();
        assert!(matches!(err, ConversionError::InvalidOutput(_)));
    }

    #[test]
    fn slow_engine_times_out() {
        let fx = Fixture::new("sleep 5\n");
        let err = fx
            .converter(Duration::from_millis(200))
            .convert(b"%PDF")
            .unwrap_err();
        assert!(matches!(err, ConversionError::Timeout { step: "scan", .. }));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let converter = CommandConverter::new(
            ConverterConfig {
                program: "/nonexistent/unp2epc".into(),
                args: vec![],
                timeout: Duration::from_secs(1),
            },
            runtime.handle().clone(),
        );
        assert!(matches!(
            converter.convert(b"%PDF"),
            Err(ConversionError::Spawn { .. })
        ));
    }
}
