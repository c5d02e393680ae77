// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod address;
pub mod attach;
pub mod common;
pub mod compose;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod format;
pub mod logger;
pub mod mailbox;
pub mod mailcap;
pub mod message;
pub mod mime;
pub mod send;
pub mod settings;
pub mod utils;
