//! Backend adapters implementing the pipeline contracts.

pub mod email;
pub mod telegram;

pub use email::{EmailConfig, EmailDestination, EmailSource, ImapMailbox, MailSender, Mailbox, SmtpMailer};
pub use telegram::{BotApi, TelegramBotApi, TelegramConfig, TelegramDestination, TelegramSource};
