// Repository layer for database operations
// Store traits are the seams services depend on; Pg* types implement them on Postgres.

pub mod record;
pub mod run;
pub mod schedule;

pub use record::{PersistOutcome, PgRecordStore, RecordStore};
pub use run::{PgRunStore, RunStore};
pub use schedule::{PgScheduleStore, ScheduleStore};
