use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::model::{NewQueueEntry, Priority, QueueEntry};
use super::store::QueueStore;
use crate::clock::Clock;

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("message text is empty")]
    EmptyMessage,

    #[error("'{0}' is not a valid phone number")]
    InvalidPhoneNumber(String),

    #[error("none of the {submitted} recipient(s) had a valid phone number")]
    NoValidRecipients { submitted: usize },

    #[error("max_attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(i32),

    #[error("no recipient directory is configured")]
    DirectoryUnavailable,

    #[error("recipient lookup failed: {0}")]
    Directory(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Normalizes a raw phone number, or rejects it.
pub trait PhoneValidator: Send + Sync {
    fn normalize(&self, raw: &str) -> Option<String>;
}

/// E.164 normalization: `+` followed by 8 to 15 digits. Numbers without an
/// international prefix get `default_country_code` prepended.
#[derive(Debug, Clone)]
pub struct E164Validator {
    default_country_code: Option<String>,
}

impl E164Validator {
    pub fn new(default_country_code: Option<String>) -> Self {
        let default_country_code = default_country_code
            .map(|cc| cc.trim().trim_start_matches('+').to_string())
            .filter(|cc| !cc.is_empty() && cc.chars().all(|c| c.is_ascii_digit()));
        Self {
            default_country_code,
        }
    }
}

impl Default for E164Validator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PhoneValidator for E164Validator {
    fn normalize(&self, raw: &str) -> Option<String> {
        let compact: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
            .collect();

        let digits = if let Some(rest) = compact.strip_prefix('+') {
            rest.to_string()
        } else if let Some(rest) = compact.strip_prefix("00") {
            rest.to_string()
        } else {
            let cc = self.default_country_code.as_deref()?;
            if compact.starts_with(cc) && compact.len() > cc.len() + 7 {
                compact
            } else {
                format!("{cc}{compact}")
            }
        };

        let valid = (8..=15).contains(&digits.len())
            && digits.chars().all(|c| c.is_ascii_digit())
            && !digits.starts_with('0');
        valid.then(|| format!("+{digits}"))
    }
}

/// Resolves segments and address books to phone numbers. Contacts and
/// segments are owned elsewhere; this is the only view the queue has of them.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn segment_numbers(&self, segment_id: Uuid) -> anyhow::Result<Vec<String>>;

    async fn user_contact_numbers(&self, user_id: Uuid) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub user_id: Option<Uuid>,
    pub segment_id: Option<Uuid>,
    pub sender_name: Option<String>,
    /// Falls back to the configured default.
    pub max_attempts: Option<i32>,
    /// Send no earlier than this. Defaults to now.
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// One recipient of a bulk send, optionally overriding the batch priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRecipient {
    pub phone_number: String,
    pub priority: Option<Priority>,
}

impl BulkRecipient {
    pub fn with_priority(phone_number: impl Into<String>, priority: Priority) -> Self {
        Self {
            phone_number: phone_number.into(),
            priority: Some(priority),
        }
    }
}

impl From<String> for BulkRecipient {
    fn from(phone_number: String) -> Self {
        Self {
            phone_number,
            priority: None,
        }
    }
}

impl From<&str> for BulkRecipient {
    fn from(phone_number: &str) -> Self {
        phone_number.to_string().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    pub batch_id: Uuid,
    pub accepted: usize,
    /// Numbers the validator rejected.
    pub skipped: usize,
    /// Repeats of a number already accepted in the same call.
    pub duplicates: usize,
}

/// Writes new pending entries. Every call is one transactional insert.
pub struct QueueEnqueuer {
    store: Arc<dyn QueueStore>,
    validator: Arc<dyn PhoneValidator>,
    directory: Option<Arc<dyn RecipientDirectory>>,
    clock: Arc<dyn Clock>,
    default_max_attempts: i32,
}

impl QueueEnqueuer {
    pub fn new(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>, default_max_attempts: i32) -> Self {
        Self {
            store,
            validator: Arc::new(E164Validator::default()),
            directory: None,
            clock,
            default_max_attempts: default_max_attempts.max(1),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn PhoneValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn RecipientDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub async fn enqueue(
        &self,
        phone_number: &str,
        message: &str,
        options: EnqueueOptions,
    ) -> Result<QueueEntry, EnqueueError> {
        check_request(message, &options)?;
        let phone_number = self
            .validator
            .normalize(phone_number)
            .ok_or_else(|| EnqueueError::InvalidPhoneNumber(phone_number.to_string()))?;

        let entry = QueueEntry::pending(
            new_entry(phone_number, message, options.priority, &options),
            Uuid::new_v4(),
            self.default_max_attempts,
            self.clock.now(),
        );
        self.store.insert_batch(std::slice::from_ref(&entry)).await?;

        tracing::debug!(
            entry_id = %entry.id,
            batch_id = %entry.batch_id,
            priority = entry.priority.as_str(),
            "message enqueued"
        );
        Ok(entry)
    }

    pub async fn enqueue_bulk<I, R>(
        &self,
        recipients: I,
        message: &str,
        options: EnqueueOptions,
    ) -> Result<BatchReceipt, EnqueueError>
    where
        I: IntoIterator<Item = R>,
        R: Into<BulkRecipient>,
    {
        check_request(message, &options)?;

        let batch_id = Uuid::new_v4();
        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let (mut submitted, mut skipped, mut duplicates) = (0, 0, 0);

        for recipient in recipients {
            let recipient: BulkRecipient = recipient.into();
            submitted += 1;

            let Some(phone_number) = self.validator.normalize(&recipient.phone_number) else {
                skipped += 1;
                continue;
            };
            if !seen.insert(phone_number.clone()) {
                duplicates += 1;
                continue;
            }

            let priority = recipient.priority.unwrap_or(options.priority);
            entries.push(QueueEntry::pending(
                new_entry(phone_number, message, priority, &options),
                batch_id,
                self.default_max_attempts,
                now,
            ));
        }

        if entries.is_empty() {
            return Err(EnqueueError::NoValidRecipients { submitted });
        }

        self.store.insert_batch(&entries).await?;

        tracing::info!(
            batch_id = %batch_id,
            accepted = entries.len(),
            skipped,
            duplicates,
            "batch enqueued"
        );
        Ok(BatchReceipt {
            batch_id,
            accepted: entries.len(),
            skipped,
            duplicates,
        })
    }

    pub async fn enqueue_segment(
        &self,
        segment_id: Uuid,
        message: &str,
        mut options: EnqueueOptions,
    ) -> Result<BatchReceipt, EnqueueError> {
        check_request(message, &options)?;
        let numbers = self
            .directory()?
            .segment_numbers(segment_id)
            .await
            .map_err(EnqueueError::Directory)?;

        options.segment_id = Some(segment_id);
        self.enqueue_bulk(numbers, message, options).await
    }

    pub async fn enqueue_all_contacts(
        &self,
        user_id: Uuid,
        message: &str,
        mut options: EnqueueOptions,
    ) -> Result<BatchReceipt, EnqueueError> {
        check_request(message, &options)?;
        let numbers = self
            .directory()?
            .user_contact_numbers(user_id)
            .await
            .map_err(EnqueueError::Directory)?;

        options.user_id = Some(user_id);
        self.enqueue_bulk(numbers, message, options).await
    }

    fn directory(&self) -> Result<&Arc<dyn RecipientDirectory>, EnqueueError> {
        self.directory.as_ref().ok_or(EnqueueError::DirectoryUnavailable)
    }
}

fn check_request(message: &str, options: &EnqueueOptions) -> Result<(), EnqueueError> {
    if message.trim().is_empty() {
        return Err(EnqueueError::EmptyMessage);
    }
    match options.max_attempts {
        Some(n) if n < 1 => Err(EnqueueError::InvalidMaxAttempts(n)),
        _ => Ok(()),
    }
}

fn new_entry(
    phone_number: String,
    message: &str,
    priority: Priority,
    options: &EnqueueOptions,
) -> NewQueueEntry {
    NewQueueEntry {
        phone_number,
        message: message.to_string(),
        user_id: options.user_id,
        segment_id: options.segment_id,
        sender_name: options.sender_name.clone(),
        priority,
        max_attempts: options.max_attempts,
        scheduled_at: options.scheduled_at,
    }
}
