/*!
# Mountwatch DevKit - test doubles for the monitor

- `FakeProber`: per-host scripted answers for every probe, records each call
- `RecordingMailer`: keeps every message, can be told to fail
- `ConfigBuilder`: a valid `MonitorConfig` without a TOML file
- `TestHarness`: all of the above wired to an in-memory store
*/

pub mod builders;
pub mod fake_prober;
pub mod mailer_stub;
pub mod test_utils;

pub use builders::ConfigBuilder;
pub use fake_prober::{FakeProber, ProbeCall};
pub use mailer_stub::{RecordingMailer, SentMessage};
pub use test_utils::TestHarness;
