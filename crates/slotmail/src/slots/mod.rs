pub mod manager;
pub mod types;

pub use manager::{CustomSmtpSettings, SlotManager};
pub use types::{
    AuthKind, ErrorLog, InvalidSlotNumber, Provider, SlotNumber, SlotPosition, SlotStatus,
    SlotToggle, SmtpSlot, StoredCredentials, MAX_SLOTS,
};
