//! Domain models for retainer billing.

mod agreement;
mod company;
mod fragment;
mod invoice;
mod line;
mod period;
mod time_record;

pub use agreement::{Agreement, NewAgreement};
pub use company::Company;
pub use fragment::{AllocationType, TimeFragment};
pub use invoice::{
    Invoice, InvoiceBalances, InvoiceStatus, NewInvoice, Payment, UpdateInvoice,
};
pub use line::{InvoiceLine, LineType, ManualLine, NewInvoiceLine};
pub use period::{month_index, DateRange, InvoicePeriod};
pub use time_record::{MergeKey, NewTimeRecord, TimeRecord, UpdateTimeRecord};
