use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Error,
    Warning,
    Info,
    Priority,
    Status,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MessageType::Error => "ERROR",
            MessageType::Warning => "WARN",
            MessageType::Info => "INFO",
            MessageType::Priority => "PRIORITY",
            MessageType::Status => "STATUS",
        };
        write!(f, "{}", tag)
    }
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub timestamp: DateTime<Local>,
    pub message_type: MessageType,
    pub content: String,
}

impl StatusMessage {
    pub fn new(message_type: MessageType, content: String) -> Self {
        StatusMessage {
            timestamp: Local::now(),
            message_type,
            content,
        }
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {:<8} | {}",
            self.timestamp.format("%H:%M:%S"),
            self.message_type.to_string(),
            self.content
        )
    }
}

/// Bounded history of runtime messages. In headless mode every message is
/// echoed to stdout as it arrives.
pub struct MessageLog {
    messages: VecDeque<StatusMessage>,
    headless: bool,
    max_size: usize,
}

impl MessageLog {
    pub fn new(headless: bool, max_size: Option<usize>) -> Self {
        MessageLog {
            messages: VecDeque::new(),
            headless,
            max_size: max_size.unwrap_or(500).max(1),
        }
    }

    pub fn add_message(&mut self, message: StatusMessage) {
        if self.headless {
            println!("{}", message);
        }
        if self.messages.len() >= self.max_size {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn get_all_messages(&self) -> Vec<StatusMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn get_recent_messages(&self, count: usize) -> Vec<StatusMessage> {
        let skip = self.messages.len().saturating_sub(count);
        self.messages.iter().skip(skip).cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.messages.len()
    }

    pub fn count_of(&self, message_type: MessageType) -> usize {
        self.messages
            .iter()
            .filter(|m| m.message_type == message_type)
            .count()
    }
}
