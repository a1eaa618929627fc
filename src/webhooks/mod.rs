pub mod monzo;

pub use monzo::{Summary, WebhookBody, WebhookResponse, WebhookService};
