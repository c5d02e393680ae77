// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod body;
pub mod encoding;
pub mod param;
pub mod parse;
pub mod write;
