pub mod delivery;
pub mod email;
pub mod scheduler;

pub use delivery::{DeliveryError, LogMailer, Mailer};
pub use email::SmtpMailer;
pub use scheduler::{decide, DispatchOutcome, FlushOutcome, NotificationScheduler};
