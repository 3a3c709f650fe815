//! JSON-file backed credential directory

use super::{root_topic_hash, AdminRecord, Directory, ReaderRecord, SubjectRecord};
use crate::error::Result;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_true() -> bool {
    true
}

/// Tenant (workspace) with its administrator
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TenantEntry {
    pub id: String,
    /// Administrator login, source of the root topic hash
    pub login: String,
    /// Secret the administrator connects with
    pub mqtt_token: String,
    /// Secret shared by the tenant's readers
    pub access_token: String,
}

/// Door-access reader
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReaderEntry {
    pub id: String,
    pub tenant: String,
    pub code: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub archived: bool,
}

/// Mobile app user
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    pub tenant: String,
    pub email: String,
    pub mqtt_token: String,
    /// Linked access subject id
    #[serde(default)]
    pub subject: Option<String>,
}

/// Access subject
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubjectEntry {
    pub id: String,
    pub mobile_token: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub archived: bool,
}

/// Named set of readers
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReadersGroupEntry {
    pub id: String,
    #[serde(default)]
    pub readers: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub archived: bool,
}

/// Grants subjects access to readers, directly or through groups
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AccessSettingEntry {
    pub id: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub readers: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub archived: bool,
}

/// Directory file format
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryData {
    pub tenants: Vec<TenantEntry>,
    pub readers: Vec<ReaderEntry>,
    pub users: Vec<UserEntry>,
    pub subjects: Vec<SubjectEntry>,
    pub groups: Vec<ReadersGroupEntry>,
    pub settings: Vec<AccessSettingEntry>,
}

impl DirectoryData {
    fn reader(&self, id: &str) -> Option<&ReaderEntry> {
        self.readers
            .iter()
            .find(|r| r.id == id && r.enabled && !r.archived)
    }

    fn group(&self, id: &str) -> Option<&ReadersGroupEntry> {
        self.groups
            .iter()
            .find(|g| g.id == id && g.enabled && !g.archived)
    }

    /// Codes of active readers granted to a subject, first occurrence order
    fn reader_codes_for(&self, subject: &SubjectEntry) -> Vec<String> {
        if !subject.enabled || subject.archived {
            return Vec::new();
        }

        let settings = self
            .settings
            .iter()
            .filter(|s| s.enabled && !s.archived && s.subjects.contains(&subject.id));

        let mut seen = HashSet::new();
        let mut codes = Vec::new();
        for setting in settings {
            let via_groups = setting
                .groups
                .iter()
                .filter_map(|id| self.group(id))
                .flat_map(|g| g.readers.iter());

            for reader in via_groups
                .chain(setting.readers.iter())
                .filter_map(|id| self.reader(id))
            {
                if seen.insert(reader.code.clone()) {
                    codes.push(reader.code.clone());
                }
            }
        }
        codes
    }
}

/// Directory loaded from a JSON file
pub struct FileDirectory {
    /// Source file, absent for in-memory data
    path: Option<PathBuf>,
    data: Arc<RwLock<DirectoryData>>,
}

impl FileDirectory {
    /// Load from a JSON file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = load_directory_file(path)?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            data: Arc::new(RwLock::new(data)),
        })
    }

    pub fn from_data(data: DirectoryData) -> Self {
        Self {
            path: None,
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Re-read the source file
    pub fn reload(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            *self.data.write() = load_directory_file(path)?;
        }
        Ok(())
    }

    pub fn tenant_count(&self) -> usize {
        self.data.read().tenants.len()
    }
}

#[async_trait]
impl Directory for FileDirectory {
    async fn resolve_admin(&self, login: &str, secret: &str) -> Result<Option<AdminRecord>> {
        let data = self.data.read();
        Ok(data
            .tenants
            .iter()
            .find(|t| t.login == login && t.mqtt_token == secret)
            .map(|t| AdminRecord {
                root_topic: root_topic_hash(&t.login),
            }))
    }

    async fn resolve_reader(
        &self,
        root_topic_hash_value: &str,
        access_token: &str,
        code: &str,
    ) -> Result<Option<ReaderRecord>> {
        let data = self.data.read();

        let Some(tenant) = data.tenants.iter().find(|t| {
            t.access_token == access_token && root_topic_hash(&t.login) == root_topic_hash_value
        }) else {
            return Ok(None);
        };

        Ok(data
            .readers
            .iter()
            .find(|r| r.tenant == tenant.id && r.code == code)
            .map(|r| ReaderRecord {
                reader_id: r.id.clone(),
                root_topic: root_topic_hash(&tenant.login),
            }))
    }

    async fn resolve_subject(
        &self,
        tenant_id: &str,
        email: &str,
        token: &str,
    ) -> Result<Option<SubjectRecord>> {
        let data = self.data.read();

        let Some(user) = data
            .users
            .iter()
            .find(|u| u.tenant == tenant_id && u.email == email && u.mqtt_token == token)
        else {
            return Ok(None);
        };
        let Some(tenant) = data.tenants.iter().find(|t| t.id == user.tenant) else {
            return Ok(None);
        };
        let Some(subject) = user
            .subject
            .as_deref()
            .and_then(|id| data.subjects.iter().find(|s| s.id == id))
        else {
            return Ok(None);
        };

        Ok(Some(SubjectRecord {
            root_topic: root_topic_hash(&tenant.login),
            mobile_token: subject.mobile_token.clone(),
            reader_codes: data.reader_codes_for(subject),
        }))
    }
}

fn load_directory_file(path: &Path) -> anyhow::Result<DirectoryData> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read directory file: {}", path.display()))?;

    serde_json::from_str(&contents).context("Failed to parse JSON directory file")
}
