//!  Storage is organized through [activity_log::JsonActivityLog].
//!  The basic idea is:
//!   - There is a directory with all the records.
//!   - Every local calendar day has its own record file, created lazily with its first entry.
//!   - Records are JSON lines appended in capture order and never rewritten by the tracker.

pub mod activity_log;
pub mod entities;
pub mod stats;
