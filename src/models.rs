use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::schema::*;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";
pub const ROLE_COMPANY_ADMIN: &str = "company_admin";
pub const ROLE_PROCESSOR: &str = "processor";

pub const ROLES: &[&str] = &[ROLE_ADMIN, ROLE_USER, ROLE_COMPANY_ADMIN, ROLE_PROCESSOR];

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = companies)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = companies)]
pub struct NewCompany {
    pub name: String,
    pub code: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub password_hash: String,
    pub role: String,
    pub company_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub username: String,
    pub name: String,
    pub password_hash: String,
    pub role: String,
    pub company_id: Option<i64>,
}

/// Source platform a record was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Douyin,
    Xiaohongshu,
    Taobao,
    Xianyu,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Douyin,
        Platform::Xiaohongshu,
        Platform::Taobao,
        Platform::Xianyu,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Douyin => "douyin",
            Platform::Xiaohongshu => "xiaohongshu",
            Platform::Taobao => "taobao",
            Platform::Xianyu => "xianyu",
        }
    }

    /// Display label used by downstream order systems.
    pub fn label(self) -> &'static str {
        match self {
            Platform::Douyin => "抖音",
            Platform::Xiaohongshu => "小红书",
            Platform::Taobao => "淘宝",
            Platform::Xianyu => "闲鱼",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPlatform(pub String);

impl fmt::Display for UnknownPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "platform must be one of douyin, xiaohongshu, taobao, xianyu (got {:?})",
            self.0
        )
    }
}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|platform| platform.as_str() == value)
            .ok_or_else(|| UnknownPlatform(value.to_string()))
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations)]
#[diesel(table_name = data_records)]
#[diesel(belongs_to(User, foreign_key = submitter_id))]
pub struct DataRecord {
    pub id: i64,
    pub image_url: Option<String>,
    pub chat_images: Option<serde_json::Value>,
    pub submitter_id: i64,
    pub platform: String,
    pub platform_id: Option<String>,
    pub phone: Option<String>,
    pub is_duplicate: bool,
    pub synced_to_external: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = data_records)]
pub struct NewDataRecord {
    pub image_url: Option<String>,
    pub chat_images: Option<serde_json::Value>,
    pub submitter_id: i64,
    pub platform: String,
    pub platform_id: Option<String>,
    pub phone: Option<String>,
    pub is_duplicate: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Associations)]
#[diesel(table_name = data_record_assignments)]
#[diesel(belongs_to(DataRecord))]
#[diesel(belongs_to(Company))]
pub struct Assignment {
    pub id: i64,
    pub data_record_id: i64,
    pub company_id: i64,
    pub assigned_to: Option<i64>,
    pub assigned_on_claim: bool,
    pub is_claimed: bool,
    pub claimed_at: Option<NaiveDateTime>,
    pub is_completed: bool,
    pub assigned_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Assignment {
    /// True when the row still waits for a claim and `user_id` may take it.
    pub fn is_claimable_by(&self, user_id: i64) -> bool {
        !self.is_claimed && self.assigned_to.map_or(true, |owner| owner == user_id)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = data_record_assignments)]
pub struct NewAssignment {
    pub data_record_id: i64,
    pub company_id: i64,
    pub assigned_to: Option<i64>,
    pub assigned_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_platforms() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>(), Ok(platform));
        }
    }

    #[test]
    fn rejects_unknown_platform() {
        let err = "weibo".parse::<Platform>().unwrap_err();
        assert!(err.to_string().contains("weibo"));
    }
}
