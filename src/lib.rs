/*!
# RA Tools Hub Relay

Upload-and-retrieve file relay behind the RA Tools Hub pages, built in Rust.

## Overview

Each tool page in the hub lets a user upload an Office document (Excel or
Word) to a separately hosted backend and download what that backend
produces: an Excel workbook, a zip archive or a Word document. The
transformations themselves happen in external processes; this crate moves
the files between the browser and those processes.

## Architecture

### Relay Proxy (server side)
- **Technologies**: Rust, axum, tokio
- **Endpoints** (served at the root and again under `/api/<tool>`):
  - `POST /upload` - single-file multipart upload (field `file`)
  - `GET /download/{id}` - result of an earlier upload
  - `POST /clear-template` - reset the shared working template
  - `GET /health` - readiness details
  - `GET /template` - the blank input template
- **Collaborators**: a local command run once per upload, or a backend
  service the upload is forwarded to over HTTP

### Relay Client
- **Technologies**: reqwest
- Submits a file the way a tool page does and decides from the response
  headers whether it got a file to save or a status message

## Retrieval Modes

- **Isolated** (default): every upload owns `<upload_dir>/<id>/`, so a
  download only ever returns the output produced for its own id
- **Shared**: uploads are saved as `<upload_dir>/<id>-<name>` and every
  download serves the one fixed output file, whichever id is asked for

## Processing Modes

- **Blocking** (default): `/upload` answers once the command has exited
- **Deferred**: `/upload` answers 202 straight away; the command runs on a
  bounded worker pool and `/download/{id}` answers 202 until it is done

## Modules

- **tools**: Static catalogue of the hub's tools and their backends
- **correlation**: File ids linking an upload to its download
- **upload**: Uploaded files, extension checks and filename sanitising
- **envelope**: Versioned JSON body of every non-file response
- **config**: `RA_*` environment configuration
- **error**: HTTP-facing error type
- **store**: Upload directory layout and the job table
- **processor**: External command runner with a bounded worker pool
- **downloader**: Attachment responses (`Content-Type`, `Content-Disposition`)
- **template**: Resetting the working template to its header row
- **client**: Relay client used by the CLI and for HTTP forwarding
- **app**: Routing and handlers
*/

pub mod config;
pub mod correlation;
pub mod envelope;
pub mod tools;
pub mod upload;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod client;
#[cfg(feature = "web")]
pub mod downloader;
#[cfg(feature = "web")]
pub mod error;
#[cfg(feature = "web")]
pub mod processor;
#[cfg(feature = "web")]
pub mod store;
#[cfg(feature = "web")]
pub mod template;

/// Re-export the types most callers need
pub use config::{Collaborator, ProcessingMode, ProcessorCommand, RelayConfig, RetrievalMode};
pub use correlation::CorrelationId;
pub use envelope::{Envelope, EnvelopeStatus};
pub use tools::{TOOLS, ToolProfile, find_tool};
pub use upload::{UploadError, UploadedFile};
