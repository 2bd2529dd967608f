use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform roles a broadcast can target as a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Tutor,
    Parent,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Student => write!(f, "student"),
            Role::Teacher => write!(f, "teacher"),
            Role::Tutor => write!(f, "tutor"),
            Role::Parent => write!(f, "parent"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// Declarative description of who receives a broadcast.
///
/// Serialized as `{"type": "by_subject", "value": "<uuid>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TargetSpec {
    /// Every active user with the given role
    AllOfRole(Role),
    /// Students enrolled in a subject
    BySubject(Uuid),
    /// Students assigned to a tutor
    ByTutor(Uuid),
    /// Students enrolled in any subject the teacher teaches
    ByTeacher(Uuid),
    /// An explicit list of user IDs
    Custom(Vec<Uuid>),
}

impl TargetSpec {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TargetSpec::AllOfRole(_) => "all_of_role",
            TargetSpec::BySubject(_) => "by_subject",
            TargetSpec::ByTutor(_) => "by_tutor",
            TargetSpec::ByTeacher(_) => "by_teacher",
            TargetSpec::Custom(_) => "custom",
        }
    }
}

/// Broadcast lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum BroadcastStatus {
    Draft,
    Sending,
    Completed,
    Failed,
    Cancelled,
}

impl BroadcastStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BroadcastStatus::Completed | BroadcastStatus::Failed | BroadcastStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastStatus::Draft => write!(f, "draft"),
            BroadcastStatus::Sending => write!(f, "sending"),
            BroadcastStatus::Completed => write!(f, "completed"),
            BroadcastStatus::Failed => write!(f, "failed"),
            BroadcastStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-record delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent | DeliveryStatus::Failed | DeliveryStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Processing => write!(f, "processing"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ChannelType {
    InApp,
    Email,
    Sms,
    Push,
    Webhook,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::InApp => write!(f, "in_app"),
            ChannelType::Email => write!(f, "email"),
            ChannelType::Sms => write!(f, "sms"),
            ChannelType::Push => write!(f, "push"),
            ChannelType::Webhook => write!(f, "webhook"),
        }
    }
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum NotificationKind {
    #[default]
    Announcement,
    Reminder,
    Assignment,
    Grade,
    Payment,
    System,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Announcement => write!(f, "announcement"),
            NotificationKind::Reminder => write!(f, "reminder"),
            NotificationKind::Assignment => write!(f, "assignment"),
            NotificationKind::Grade => write!(f, "grade"),
            NotificationKind::Payment => write!(f, "payment"),
            NotificationKind::System => write!(f, "system"),
        }
    }
}

/// Reference to the platform object a notification concerns (a lesson, an invoice, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedObject {
    pub kind: String,
    pub id: String,
}

/// One entry of a broadcast's append-only error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Utc>,
    pub recipient_id: Option<Uuid>,
    pub channel: Option<ChannelType>,
    pub reason: String,
}

/// One fan-out job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Broadcast {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub priority: Priority,
    #[sqlx(json)]
    pub related_object: Option<RelatedObject>,
    #[sqlx(json)]
    pub target_spec: TargetSpec,
    #[sqlx(json)]
    pub channels: Vec<ChannelType>,
    pub status: BroadcastStatus,
    /// Number of delivery records (recipients × channels), set once materialized.
    pub recipient_count: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub max_attempts: i32,
    #[sqlx(json)]
    pub error_log: Vec<ErrorLogEntry>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the scheduler claimed the broadcast for sending.
    pub sent_at: Option<DateTime<Utc>>,
    pub materialized_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Broadcast {
    pub fn payload(&self) -> OutboundMessage {
        OutboundMessage {
            broadcast_id: self.id,
            title: self.title.clone(),
            body: self.message.clone(),
            kind: self.kind,
            priority: self.priority,
            related_object: self.related_object.clone(),
        }
    }
}

/// Per broadcast × recipient × channel unit of delivery work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub broadcast_id: Uuid,
    pub recipient_id: Uuid,
    pub channel: ChannelType,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    /// When this record next becomes eligible for dispatch.
    pub scheduled_at: DateTime<Utc>,
    /// Token of the worker batch currently holding the record in `processing`.
    pub lease_id: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An in-app notification row, as read by the platform's inbox views.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub broadcast_id: Option<Uuid>,
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub priority: Priority,
    #[sqlx(json)]
    pub related_object: Option<RelatedObject>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Channel addresses for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    #[sqlx(rename = "id")]
    pub user_id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub push_token: Option<String>,
    pub chat_id: Option<String>,
}

impl Recipient {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }
}

/// Human-readable payload handed to a channel sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub broadcast_id: Uuid,
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub related_object: Option<RelatedObject>,
}
