//! Audit telemetry for the rotation control plane.
//!
//! Every lifecycle decision (starts, stops, rejections, cutovers) becomes an
//! [`AuditEvent`]: stamped with a process-monotonic timestamp, appended to an
//! append-only [`AuditSink`], and published to a live subscriber feed.
//! Recording is non-blocking and never fails the operation that produced the
//! event. Externally submitted violation reports pass the [`ReportGate`]
//! before they are parsed or logged.

mod event;
mod feed;
mod reports;
mod sink;

pub use event::{Actor, AuditAction, AuditEvent, AuditResult};
pub use feed::AuditRecorder;
pub use reports::{ReportGate, ReportRejected, ViolationReport};
pub use sink::{AuditSink, MemorySink, TracingSink};
