//! Ahead-of-time compilation through the native compiler
//!
//! The compiler is treated as a black box: the bundle goes in on stdin, the
//! bytecode comes out on stdout and diagnostics on stderr. The exit status
//! and the output together decide success.

use crate::error::{BuildError, Result, SourceMap};
use crate::types::{
    BundledArtifact, OutputArtifact, DEFAULT_COMPILER_FLAGS, EMIT_BINARY_FLAG, HBC_HEADER_PREFIX_SIZE,
    HBC_MAGIC,
};
use crate::writer::artifact_file_name;
use byteorder::{ByteOrder, LittleEndian};
use regex::{Captures, Regex};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

/// Turns a bundle into bytecode
pub trait BytecodeCompiler {
    fn compile(&self, artifact: &BundledArtifact) -> Result<OutputArtifact>;
}

/// A finished compiler process
#[derive(Debug, Clone)]
pub struct CompilerInvocation {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub status: ExitStatus,
}

impl CompilerInvocation {
    pub fn command_line(&self) -> String {
        command_line(&self.binary, &self.args)
    }

    /// Map the process result to bytecode or an error
    pub fn into_output(self, source_map: Option<&SourceMap>) -> Result<Vec<u8>> {
        if !self.status.success() {
            let stderr = self.stderr.trim();
            if !stderr.is_empty() {
                let diagnostics = match source_map {
                    Some(map) => annotate_diagnostics(stderr, map),
                    None => stderr.to_string(),
                };
                return Err(BuildError::compilation(diagnostics));
            }
            return Err(BuildError::compilation(format!(
                "{} {}",
                self.binary.display(),
                describe_status(&self.status)
            )));
        }

        if self.stdout.is_empty() {
            return Err(BuildError::compilation(format!(
                "compiler exited successfully but produced no output; reproduce with: {} < bundle.js",
                self.command_line()
            )));
        }

        Ok(self.stdout)
    }
}

fn command_line(binary: &Path, args: &[String]) -> String {
    let mut parts = vec![binary.display().to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("was terminated by signal {}", signal);
        }
    }
    "exited abnormally".to_string()
}

/// Append the originating `[module:line]` to `<file>:<line>:<col>` locations
pub fn annotate_diagnostics(stderr: &str, source_map: &SourceMap) -> String {
    let location = match Regex::new(r"(?m)^([^:\s]+):(\d+):(\d+)") {
        Ok(re) => re,
        Err(_) => return stderr.to_string(),
    };
    location
        .replace_all(stderr, |caps: &Captures| {
            let whole = caps[0].to_string();
            let original = caps[2]
                .parse::<usize>()
                .ok()
                .and_then(|line| source_map.get_original_location(line));
            match original {
                Some((module, line)) => format!("{} [{}:{}]", whole, module, line),
                None => whole,
            }
        })
        .into_owned()
}

/// Hermes bytecode version, if `bytes` starts with the bytecode magic
pub fn read_header(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < HBC_HEADER_PREFIX_SIZE {
        return None;
    }
    if LittleEndian::read_u64(&bytes[0..8]) != HBC_MAGIC {
        return None;
    }
    Some(LittleEndian::read_u32(&bytes[8..12]))
}

/// The compiler binary run as a subprocess
#[derive(Debug, Clone)]
pub struct ExternalCompiler {
    binary: PathBuf,
    flags: Vec<String>,
}

impl ExternalCompiler {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            flags: DEFAULT_COMPILER_FLAGS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.flags.len() + 1);
        args.push(EMIT_BINARY_FLAG.to_string());
        args.extend(self.flags.iter().cloned());
        args
    }

    pub fn command_line(&self) -> String {
        command_line(&self.binary, &self.args())
    }

    /// Run the compiler over `input` and wait for it to exit
    pub fn invoke(&self, input: &[u8]) -> Result<CompilerInvocation> {
        let args = self.args();
        log::debug!("Running {}", command_line(&self.binary, &args));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BuildError::compilation(format!(
                    "failed to start {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        // Fed from a separate thread so a compiler filling its stdout pipe cannot deadlock us
        let feeder = child.stdin.take().map(|mut stdin| {
            let input = input.to_vec();
            thread::spawn(move || match stdin.write_all(&input) {
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            })
        });

        let output = child.wait_with_output().map_err(|e| {
            BuildError::compilation(format!("failed to wait for {}: {}", self.binary.display(), e))
        })?;

        if let Some(feeder) = feeder {
            match feeder.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Could not write the whole bundle to the compiler: {}", e),
                Err(_) => log::warn!("Compiler input thread panicked"),
            }
        }

        Ok(CompilerInvocation {
            binary: self.binary.clone(),
            args,
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status,
        })
    }
}

impl BytecodeCompiler for ExternalCompiler {
    fn compile(&self, artifact: &BundledArtifact) -> Result<OutputArtifact> {
        let invocation = self.invoke(artifact.code.as_bytes())?;
        if !invocation.stderr.trim().is_empty() && invocation.status.success() {
            log::warn!("Compiler diagnostics:\n{}", invocation.stderr.trim_end());
        }
        let bytes = invocation.into_output(Some(&artifact.source_map))?;

        match read_header(&bytes) {
            Some(version) => log::debug!("Bytecode version {}", version),
            None => log::warn!(
                "Compiler output does not start with the Hermes bytecode magic (got {})",
                hex::encode(&bytes[..bytes.len().min(8)])
            ),
        }

        Ok(OutputArtifact {
            file_name: artifact_file_name(&artifact.file_name),
            bytes,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{fake_compiler, spawn_guard};
    use crate::types::{ExecutionOrder, ModuleId};
    use tempfile::TempDir;

    fn artifact(code: &str) -> BundledArtifact {
        let mut source_map = SourceMap::new();
        source_map.add_line_mapping(2, "util.js", 7);
        BundledArtifact {
            file_name: "index.js".to_string(),
            code: code.to_string(),
            modules: vec![ModuleId::new("index.js")],
            entry: ModuleId::new("index.js"),
            order: ExecutionOrder::Strict,
            source_map,
        }
    }

    #[test]
    fn test_args() {
        let compiler = ExternalCompiler::new("/sdk/hermesc");
        assert_eq!(compiler.args(), vec!["-emit-binary", "-O", "-w"]);
        assert_eq!(compiler.command_line(), "/sdk/hermesc -emit-binary -O -w");
    }

    #[test]
    fn test_success_pipes_stdin_to_stdout() {
        let _guard = spawn_guard();
        let dir = TempDir::new().unwrap();
        let binary = fake_compiler(&dir, "cat");

        let output = ExternalCompiler::new(binary)
            .compile(&artifact("var x = 1;\n"))
            .unwrap();
        assert_eq!(output.file_name, "index.hbc");
        assert_eq!(output.bytes, b"var x = 1;\n");
    }

    #[test]
    fn test_flags_are_passed() {
        let _guard = spawn_guard();
        let dir = TempDir::new().unwrap();
        let binary = fake_compiler(&dir, "cat >/dev/null; printf '%s ' \"$@\"");

        let output = ExternalCompiler::new(binary)
            .with_flags(vec!["-O".to_string()])
            .compile(&artifact("x"))
            .unwrap();
        assert_eq!(String::from_utf8(output.bytes).unwrap(), "-emit-binary -O ");
    }

    #[test]
    fn test_stderr_becomes_compilation_error() {
        let _guard = spawn_guard();
        let dir = TempDir::new().unwrap();
        let binary = fake_compiler(&dir, "cat >/dev/null; echo 'bad opcode' >&2; exit 1");

        let err = ExternalCompiler::new(binary).compile(&artifact("x")).unwrap_err();
        match err {
            BuildError::Compilation { message } => assert!(message.contains("bad opcode")),
            other => panic!("Expected compilation error, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_code_without_stderr() {
        let _guard = spawn_guard();
        let dir = TempDir::new().unwrap();
        let binary = fake_compiler(&dir, "exit 3");

        let err = ExternalCompiler::new(binary).compile(&artifact("x")).unwrap_err();
        assert!(err.to_string().contains("exited with code 3"));
    }

    #[test]
    fn test_empty_output_suggests_reproduction() {
        let _guard = spawn_guard();
        let dir = TempDir::new().unwrap();
        let binary = fake_compiler(&dir, "cat >/dev/null");

        let compiler = ExternalCompiler::new(binary);
        let err = compiler.compile(&artifact("x")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("produced no output"));
        assert!(message.contains(&compiler.command_line()));
    }

    #[test]
    fn test_spawn_failure() {
        let _guard = spawn_guard();
        let dir = TempDir::new().unwrap();
        let err = ExternalCompiler::new(dir.path().join("missing"))
            .compile(&artifact("x"))
            .unwrap_err();
        assert!(matches!(err, BuildError::Compilation { .. }));
    }

    #[test]
    fn test_diagnostics_are_annotated() {
        let mut map = SourceMap::new();
        map.add_line_mapping(2, "util.js", 7);
        let annotated = annotate_diagnostics(
            "<stdin>:2:5: error: invalid expression\n<stdin>:9:1: note: here",
            &map,
        );
        assert_eq!(
            annotated,
            "<stdin>:2:5 [util.js:7]: error: invalid expression\n<stdin>:9:1: note: here"
        );
    }

    #[test]
    fn test_read_header() {
        let mut bytes = vec![0u8; 16];
        LittleEndian::write_u64(&mut bytes[0..8], HBC_MAGIC);
        LittleEndian::write_u32(&mut bytes[8..12], 96);
        assert_eq!(read_header(&bytes), Some(96));
        assert_eq!(read_header(b"not bytecode"), None);
        assert_eq!(read_header(b"short"), None);
    }
}
