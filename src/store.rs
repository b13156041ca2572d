//! Store contracts consumed by the engine, and a JSON-file store implementing them.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tracing::{info, warn};

use crate::audit::AuditRecord;
use crate::types::{
    CommissionSettings, Direction, LedgerEntry, Position, PositionPatch, UserProfile,
};

pub trait LedgerStore {
    fn append(&self, entry: LedgerEntry) -> Result<String>;
    fn list_by_user(&self, user: &str) -> Result<Vec<LedgerEntry>>;
}

pub trait PortfolioStore {
    fn create(&self, position: Position) -> Result<String>;
    fn update(&self, id: &str, patch: &PositionPatch) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
    fn list_active_by_user(&self, user: &str) -> Result<Vec<Position>>;
    /// Active and closed positions, oldest first.
    fn history_by_user(&self, user: &str) -> Result<Vec<Position>>;
    /// The most recently opened active lot.
    fn find_active_by_symbol(
        &self,
        user: &str,
        symbol: &str,
        direction: Direction,
    ) -> Result<Option<Position>>;
    /// Every active lot of one symbol and direction, oldest first.
    fn list_active_lots(
        &self,
        user: &str,
        symbol: &str,
        direction: Direction,
    ) -> Result<Vec<Position>>;
}

pub trait EligibilitySource {
    fn list_eligible_users(&self) -> Result<Vec<UserProfile>>;
    fn find_user(&self, id: &str) -> Result<Option<UserProfile>>;
}

pub trait SettingsSource {
    fn commission(&self) -> Result<CommissionSettings>;
}

pub trait AuditSink {
    fn write_audit(&self, record: AuditRecord) -> Result<()>;
}

/// Every contract the orchestrator and fleet runner need from one backing store.
pub trait AdvisorStore:
    LedgerStore + PortfolioStore + EligibilitySource + SettingsSource + AuditSink
{
}

impl<T> AdvisorStore for T where
    T: LedgerStore + PortfolioStore + EligibilitySource + SettingsSource + AuditSink
{
}

/// Everything the engine persists, as one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub users: Vec<UserProfile>,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
    #[serde(default)]
    pub commission: CommissionSettings,
    #[serde(default)]
    pub audit: Vec<AuditRecord>,
}

impl StoreState {
    /// A missing file is an empty store. A file that cannot be read or decoded
    /// is moved aside first so the next write cannot overwrite it.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("store {} not found, starting empty", path.display());
            return Ok(Self::default());
        }
        let decoded = fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<Self>(&text).map_err(anyhow::Error::from));
        match decoded {
            Ok(state) => {
                info!(
                    "store {} loaded: {} users, {} positions, {} ledger entries",
                    path.display(),
                    state.users.len(),
                    state.positions.len(),
                    state.ledger.len()
                );
                Ok(state)
            }
            Err(e) => {
                let aside = quarantine_path(path);
                fs::rename(path, &aside).with_context(|| {
                    format!("store {} is unreadable ({e:#}) and could not be moved aside", path.display())
                })?;
                warn!(
                    "store {} is unreadable ({:#}); moved to {} and starting empty",
                    path.display(),
                    e,
                    aside.display()
                );
                Ok(Self::default())
            }
        }
    }

    /// Write to a sibling temp file, then rename over the store.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create store dir {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("write store {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replace store {}", path.display()))?;
        Ok(())
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    path.with_file_name(format!("{name}.corrupt-{stamp}"))
}

pub struct FileStore {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        Ok(Self {
            state: Mutex::new(StoreState::load(&path)?),
            path: Some(path),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            path: None,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    /// Mutate a copy, flush it, and only then make it visible. A failed
    /// mutation or flush leaves the store as it was.
    fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut st = self.lock()?;
        let mut next = st.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            next.save(path)?;
        }
        *st = next;
        Ok(out)
    }

    pub fn upsert_user(&self, user: UserProfile) -> Result<()> {
        self.write(|st| {
            match st.users.iter_mut().find(|u| u.id == user.id) {
                Some(u) => *u = user,
                None => st.users.push(user),
            }
            Ok(())
        })
    }

    pub fn set_commission(&self, settings: CommissionSettings) -> Result<()> {
        let valid = |pct: f64| pct.is_finite() && (0.0..100.0).contains(&pct);
        if !valid(settings.buy_pct) || !valid(settings.sell_pct) {
            anyhow::bail!(
                "commission percentages must be in [0, 100), got buy {} sell {}",
                settings.buy_pct,
                settings.sell_pct
            );
        }
        self.write(|st| {
            st.commission = settings;
            Ok(())
        })
    }

    pub fn audit_log(&self) -> Result<Vec<AuditRecord>> {
        Ok(self.lock()?.audit.clone())
    }
}

fn same_symbol(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl LedgerStore for FileStore {
    fn append(&self, entry: LedgerEntry) -> Result<String> {
        if !(entry.amount > 0.0) {
            anyhow::bail!("ledger amount must be > 0, got {}", entry.amount);
        }
        self.write(|st| {
            let id = entry.id.clone();
            st.ledger.push(entry);
            Ok(id)
        })
    }

    fn list_by_user(&self, user: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .lock()?
            .ledger
            .iter()
            .filter(|e| e.user == user)
            .cloned()
            .collect())
    }
}

impl PortfolioStore for FileStore {
    fn create(&self, position: Position) -> Result<String> {
        self.write(|st| {
            let id = position.id.clone();
            st.positions.push(position);
            Ok(id)
        })
    }

    fn update(&self, id: &str, patch: &PositionPatch) -> Result<()> {
        self.write(|st| {
            let p = st
                .positions
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| anyhow!("position {id} not found"))?;
            if let Some(q) = patch.quantity {
                p.quantity = q;
            }
            if let Some(s) = patch.status {
                p.status = s;
            }
            if patch.close_price.is_some() {
                p.close_price = patch.close_price;
            }
            if patch.close_date.is_some() {
                p.close_date = patch.close_date;
            }
            // Derived fields follow quantity and price.
            let price = patch.current_price.unwrap_or(p.current_price);
            p.revalue(price);
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.write(|st| {
            let before = st.positions.len();
            st.positions.retain(|p| p.id != id);
            if st.positions.len() == before {
                anyhow::bail!("position {id} not found");
            }
            Ok(())
        })
    }

    fn list_active_by_user(&self, user: &str) -> Result<Vec<Position>> {
        Ok(self
            .lock()?
            .positions
            .iter()
            .filter(|p| p.user == user && p.is_active())
            .cloned()
            .collect())
    }

    fn history_by_user(&self, user: &str) -> Result<Vec<Position>> {
        Ok(self
            .lock()?
            .positions
            .iter()
            .filter(|p| p.user == user)
            .cloned()
            .collect())
    }

    fn find_active_by_symbol(
        &self,
        user: &str,
        symbol: &str,
        direction: Direction,
    ) -> Result<Option<Position>> {
        // Most recently opened wins when several lots exist.
        Ok(self
            .lock()?
            .positions
            .iter()
            .rev()
            .find(|p| {
                p.user == user
                    && p.is_active()
                    && p.direction == direction
                    && same_symbol(&p.symbol, symbol)
            })
            .cloned())
    }

    fn list_active_lots(
        &self,
        user: &str,
        symbol: &str,
        direction: Direction,
    ) -> Result<Vec<Position>> {
        let mut lots: Vec<Position> = self
            .lock()?
            .positions
            .iter()
            .filter(|p| {
                p.user == user
                    && p.is_active()
                    && p.direction == direction
                    && same_symbol(&p.symbol, symbol)
            })
            .cloned()
            .collect();
        lots.sort_by_key(|p| p.created_at);
        Ok(lots)
    }
}

impl EligibilitySource for FileStore {
    fn list_eligible_users(&self) -> Result<Vec<UserProfile>> {
        Ok(self
            .lock()?
            .users
            .iter()
            .filter(|u| u.is_eligible())
            .cloned()
            .collect())
    }

    fn find_user(&self, id: &str) -> Result<Option<UserProfile>> {
        Ok(self.lock()?.users.iter().find(|u| u.id == id).cloned())
    }
}

impl SettingsSource for FileStore {
    fn commission(&self) -> Result<CommissionSettings> {
        Ok(self.lock()?.commission)
    }
}

impl AuditSink for FileStore {
    fn write_audit(&self, record: AuditRecord) -> Result<()> {
        self.write(|st| {
            st.audit.push(record);
            Ok(())
        })
    }
}
