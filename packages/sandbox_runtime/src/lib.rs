//! Sandbox Runtime - file tree mounting and process lifecycle for workspace sandboxes
//!
//! This crate provides the process-spawning collaborator used by the sandbox
//! controller. It has no HTTP dependencies and no workspace knowledge: it mounts
//! a flat `path -> contents` map into a directory, runs commands under a PTY,
//! and reports `server-ready` notifications when a process starts listening.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use sandbox_runtime::{LocalRuntime, SandboxRuntime};
//!
//! #[tokio::main]
//! async fn main() {
//!     let runtime = LocalRuntime::new("/tmp/devroom-sandbox");
//!
//!     let mut files = BTreeMap::new();
//!     files.insert("index.js".to_string(), "console.log('hi')".to_string());
//!     runtime.mount(&files).await.unwrap();
//!
//!     let mut ready = runtime.server_ready();
//!     let spawned = runtime.spawn("node", &["index.js".to_string()]).await.unwrap();
//!
//!     let mut output = spawned.output;
//!     while let Ok(chunk) = output.recv().await {
//!         print!("{}", String::from_utf8_lossy(&chunk.data));
//!     }
//!     println!("exit code: {:?}", spawned.process.wait().await);
//!     let _ = ready.try_recv();
//! }
//! ```

mod error;
mod local;
pub mod process;
pub mod ready;
mod runtime;

pub use error::RuntimeError;
pub use local::LocalRuntime;
pub use process::{ProcessActor, ProcessConfig, ProcessHandle, ProcessOutput};
pub use ready::ReadyScanner;
pub use runtime::{SandboxProcess, SandboxRuntime, ServerReady, SpawnedProcess};
