use chrono::{DateTime, Utc};
use gridcache_core::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Team,
}

impl Plan {
    pub const ALL: [Plan; 3] = [Plan::Free, Plan::Pro, Plan::Team];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Team => "team",
        }
    }

    /// Monthly price in dollars
    pub fn price(&self) -> f64 {
        match self {
            Plan::Free => 0.0,
            Plan::Pro => 29.0,
            Plan::Team => 99.0,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Trial,
    Churned,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Trial => "trial",
            Status::Churned => "churned",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One account as served by the `users` resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub plan: Plan,
    pub status: Status,
    #[serde(default)]
    pub mrr: f64,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn created_str(&self) -> String {
        self.created_at.format("%Y-%m-%d").to_string()
    }
}

impl Row for User {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if !self.email.contains('@') {
            return Err(format!("invalid email '{}'", self.email));
        }
        if !self.mrr.is_finite() || self.mrr < 0.0 {
            return Err(format!("mrr must be a non-negative amount, got {}", self.mrr));
        }
        Ok(())
    }

    fn matches_search(&self, term: &str) -> bool {
        let term = term.to_lowercase();
        self.name.to_lowercase().contains(&term) || self.email.to_lowercase().contains(&term)
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "plan" => Some(self.plan.as_str().to_string()),
            "status" => Some(self.status.as_str().to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> User {
        User {
            id: 7,
            name: "Grace Hopper".to_string(),
            email: "grace@example.com".to_string(),
            plan: Plan::Team,
            status: Status::Active,
            mrr: 99.0,
            created_at: Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_deserialize_service_row() {
        let json = r#"{
            "id": 7,
            "name": "Grace Hopper",
            "email": "grace@example.com",
            "plan": "team",
            "status": "active",
            "mrr": 99.0,
            "createdAt": "2024-03-09T12:00:00Z"
        }"#;
        let user: User = serde_json::from_str(json).unwrap();
        assert_eq!(user, sample());
        assert_eq!(user.created_str(), "2024-03-09");
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut user = sample();
        user.email = "nobody".to_string();
        assert!(user.validate().unwrap_err().contains("invalid email"));

        let mut user = sample();
        user.name = "  ".to_string();
        assert_eq!(user.validate().unwrap_err(), "name is required");

        let mut user = sample();
        user.mrr = -1.0;
        assert!(user.validate().is_err());
        user.mrr = f64::NAN;
        assert!(user.validate().is_err());
    }

    #[test]
    fn test_search_and_fields() {
        let user = sample();
        assert!(user.matches_search("hopper"));
        assert!(user.matches_search("EXAMPLE.COM"));
        assert!(!user.matches_search("lovelace"));
        assert_eq!(user.field("plan").as_deref(), Some("team"));
        assert_eq!(user.field("status").as_deref(), Some("active"));
        assert_eq!(user.field("email"), None);
    }
}
