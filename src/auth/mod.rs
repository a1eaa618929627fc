pub mod verify;

pub use verify::verify_webhook_secret;
