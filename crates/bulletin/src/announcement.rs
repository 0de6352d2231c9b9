use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target audience of an announcement, also used as a client's filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    #[default]
    All,
    Student,
    Teacher,
    Admin,
    Parent,
}

impl Audience {
    /// Check whether a client filtering by `self` should see an announcement
    /// targeted at `target`.
    ///
    /// The `All` filter admits everything; any other filter admits its own tag
    /// and announcements addressed to everyone.
    pub fn admits(self, target: Audience) -> bool {
        self == Audience::All || target == Audience::All || self == target
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Audience::All => "all",
            Audience::Student => "student",
            Audience::Teacher => "teacher",
            Audience::Admin => "admin",
            Audience::Parent => "parent",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = crate::BulletinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Audience::All),
            "student" => Ok(Audience::Student),
            "teacher" => Ok(Audience::Teacher),
            "admin" => Ok(Audience::Admin),
            "parent" => Ok(Audience::Parent),
            other => Err(crate::BulletinError::Protocol {
                message: format!("Unknown audience '{}'", other),
            }),
        }
    }
}

/// An announcement record as held in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub important: bool,
    #[serde(default)]
    pub audience: Audience,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

impl Announcement {
    /// Create an announcement with the required fields, everything else defaulted
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        audience: Audience,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            important: false,
            audience,
            created_at,
            created_by: String::new(),
            photo_url: None,
            video_url: None,
        }
    }

    /// Merge the fields present in `patch` into this record.
    ///
    /// Identity and creation time never change. Returns true if any field changed.
    pub fn merge(&mut self, patch: &AnnouncementPatch) -> bool {
        let before = self.clone();

        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(body) = &patch.body {
            self.body = body.clone();
        }
        if let Some(important) = patch.important {
            self.important = important;
        }
        if let Some(audience) = patch.audience {
            self.audience = audience;
        }
        if let Some(photo_url) = &patch.photo_url {
            self.photo_url = Some(photo_url.clone());
        }
        if let Some(video_url) = &patch.video_url {
            self.video_url = Some(video_url.clone());
        }

        *self != before
    }
}

/// Partial update delivered by the feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementPatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub important: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<Audience>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

impl AnnouncementPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}
