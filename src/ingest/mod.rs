//! Ingestion: from an uploaded input to enqueued row tasks.
//!
//! - [`Submission`] validates a bulk request, creates the job and persists
//!   the upload.
//! - [`Enqueuer`] streams the persisted input, normalizes headers, skips
//!   blank rows and enqueues tasks in bounded chunks.
//! - [`CsvReader`] reads one record at a time.

pub mod csv;
pub mod enqueuer;
pub mod submit;

pub use csv::{normalize_header, CsvReader};
pub use enqueuer::{dispatch_priority, Enqueuer, IngestJob, IngestSummary};
pub use submit::{move_file, BulkSubmission, SubmitReceipt, Submission};
