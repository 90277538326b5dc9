//! Domain layer for herald.
//!
//! Submission requests, the typed notification view and delivery outcomes.

pub mod notification;
pub mod value_objects;

pub use notification::{
    AttachmentRef, DeliveryOutcome, Notification, NotificationRequest, TemplateRef,
};
pub use value_objects::*;

pub use crate::database::models::{ChannelType, NotificationStatus};
