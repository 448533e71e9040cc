//! SQLite-backed vault hosting every entity, attribute, relationship,
//! validity, and point-in-time store.
//!
//! A `Vault` owns a single connection behind a mutex. Writers are expected
//! to be one load cycle at a time; readers may share the vault between
//! cycles.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{info, warn};

use crate::config::ChronicleConfig;
use crate::errors::{ChronicleError, ChronicleResult};
use crate::hashing::SchemaDescriptor;
use crate::store::attributes::AttributeStore;
use crate::store::entity::{self, EntityStore};
use crate::store::pit::PitProjector;
use crate::store::registry::{
    self, AttributeStoreDef, EntityStoreDef, PitDef, RelationshipDefinition, StoreKind,
    ValidityDef,
};
use crate::store::relationship::RelationshipStore;
use crate::store::schema;
use crate::store::sentinel::{self, SentinelSummary};
use crate::store::validity::ValidityTracker;

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

/// Expand `~` and make `path` absolute against the working directory.
fn resolve_path(path: &Path) -> ChronicleResult<PathBuf> {
    let expanded = expand_tilde(&path.to_string_lossy());
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

pub struct Vault {
    db_path: Option<PathBuf>,
    conn: Mutex<Connection>,
    config: ChronicleConfig,
}

impl Vault {
    /// Open (creating if needed) a vault file. Parent directories are
    /// created, WAL mode is enabled, and pending migrations are applied.
    pub fn open(db_path: impl AsRef<Path>, config: ChronicleConfig) -> ChronicleResult<Self> {
        let resolved = resolve_path(db_path.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&resolved)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        info!("Opened vault at {}", resolved.display());
        Self::initialise(conn, Some(resolved), config)
    }

    /// A private, non-persistent vault. Useful for tests and dry runs.
    pub fn open_in_memory(config: ChronicleConfig) -> ChronicleResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialise(conn, None, config)
    }

    fn initialise(
        conn: Connection,
        db_path: Option<PathBuf>,
        config: ChronicleConfig,
    ) -> ChronicleResult<Self> {
        let config = config.validated()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
            config,
        })
    }

    fn init_schema(conn: &Connection) -> ChronicleResult<()> {
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(conn)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn config(&self) -> &ChronicleConfig {
        &self.config
    }

    /// Run `f` against the connection in autocommit mode.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> ChronicleResult<T>,
    ) -> ChronicleResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside one transaction. Any error rolls the whole write set
    /// back.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> ChronicleResult<T>,
    ) -> ChronicleResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn schema_version(&self) -> i32 {
        let conn = self.conn.lock();
        schema::get_schema_version(&conn)
    }

    // -----------------------------------------------------------------------
    // Meta
    // -----------------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> ChronicleResult<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM vault_meta WHERE key = ?1 LIMIT 1;",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> ChronicleResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO vault_meta(key, value) VALUES(?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                params![key, value],
            )?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register an entity store. Re-registering is a no-op.
    pub fn register_entity_store(&self, name: &str) -> ChronicleResult<()> {
        registry::validate_name("entity store", name)?;
        let def = EntityStoreDef {
            name: name.to_string(),
        };
        let json = serde_json::to_string(&def)?;
        self.with_tx(|tx| match registry::lookup(tx, name)? {
            None => {
                registry::insert(tx, name, StoreKind::Entity, None, &json, 1)?;
                info!("Registered entity store '{name}'");
                Ok(())
            }
            Some(entry) if entry.kind == StoreKind::Entity => Ok(()),
            Some(entry) => Err(already_registered(name, entry.kind)),
        })
    }

    /// Register an attribute store on `entity_store`.
    ///
    /// Re-registering the same descriptor is a no-op. A descriptor with a
    /// higher version replaces the stored one; every subsequently loaded row
    /// is fingerprinted under the new layout. Changing the layout without a
    /// version bump, or regressing the version, is refused.
    pub fn register_attribute_store(
        &self,
        name: &str,
        entity_store: &str,
        descriptor: SchemaDescriptor,
    ) -> ChronicleResult<()> {
        registry::validate_name("attribute store", name)?;
        descriptor.validate()?;
        let def = AttributeStoreDef {
            name: name.to_string(),
            entity_store: entity_store.to_string(),
            descriptor,
        };
        let json = serde_json::to_string(&def)?;
        let version = def.descriptor.version;

        self.with_tx(|tx| {
            registry::load::<EntityStoreDef>(tx, entity_store, StoreKind::Entity)?;
            match registry::lookup(tx, name)? {
                None => {
                    registry::insert(tx, name, StoreKind::Attribute, Some(entity_store), &json, version)?;
                    // Late registrations still get ghost versions.
                    if entity::entity_exists(tx, entity_store, &crate::models::FixedHash::unknown())? {
                        sentinel::ensure_ghost_versions(tx, &def)?;
                    }
                    info!("Registered attribute store '{name}' on '{entity_store}' (v{version})");
                    Ok(())
                }
                Some(entry) if entry.kind != StoreKind::Attribute => {
                    Err(already_registered(name, entry.kind))
                }
                Some(entry) => {
                    let existing: AttributeStoreDef = serde_json::from_str(&entry.definition_json)?;
                    if existing.entity_store != def.entity_store {
                        return Err(ChronicleError::Schema(format!(
                            "attribute store '{name}' belongs to '{}', not '{entity_store}'",
                            existing.entity_store
                        )));
                    }
                    if existing == def {
                        return Ok(());
                    }
                    if version > existing.descriptor.version {
                        registry::update_definition(tx, name, &json, version)?;
                        warn!(
                            "Attribute store '{name}' migrated v{} -> v{version}; fingerprints change for every entity",
                            existing.descriptor.version
                        );
                        return Ok(());
                    }
                    Err(ChronicleError::Schema(format!(
                        "attribute store '{name}': descriptor changed without raising version above v{}",
                        existing.descriptor.version
                    )))
                }
            }
        })
    }

    pub fn register_relationship_store(&self, def: RelationshipDefinition) -> ChronicleResult<()> {
        registry::validate_relationship(&def)?;
        let json = serde_json::to_string(&def)?;
        self.with_tx(|tx| {
            for p in &def.participants {
                registry::load::<EntityStoreDef>(tx, &p.entity_store, StoreKind::Entity)?;
            }
            match registry::lookup(tx, &def.name)? {
                None => {
                    registry::insert(tx, &def.name, StoreKind::Relationship, None, &json, 1)?;
                    info!(
                        "Registered relationship store '{}' with {} participants",
                        def.name,
                        def.participants.len()
                    );
                    Ok(())
                }
                Some(entry) if entry.kind != StoreKind::Relationship => {
                    Err(already_registered(&def.name, entry.kind))
                }
                Some(entry) => {
                    let existing: RelationshipDefinition = serde_json::from_str(&entry.definition_json)?;
                    if existing == def {
                        Ok(())
                    } else {
                        Err(ChronicleError::Schema(format!(
                            "relationship store '{}' is already registered with a different shape",
                            def.name
                        )))
                    }
                }
            }
        })
    }

    pub fn register_validity_tracker(
        &self,
        name: &str,
        relationship_store: &str,
        driving_role: &str,
    ) -> ChronicleResult<()> {
        registry::validate_name("validity tracker", name)?;
        let def = ValidityDef {
            name: name.to_string(),
            relationship_store: relationship_store.to_string(),
            driving_role: driving_role.to_string(),
        };
        let json = serde_json::to_string(&def)?;
        self.with_tx(|tx| {
            let rel: RelationshipDefinition =
                registry::load(tx, relationship_store, StoreKind::Relationship)?;
            if !rel.participants.iter().any(|p| p.role == driving_role) {
                return Err(ChronicleError::Schema(format!(
                    "'{driving_role}' is not a participant role of '{relationship_store}'"
                )));
            }
            register_simple(tx, name, StoreKind::Validity, Some(relationship_store), &json)
        })
    }

    pub fn register_pit(
        &self,
        name: &str,
        entity_store: &str,
        attribute_stores: &[&str],
    ) -> ChronicleResult<()> {
        registry::validate_name("PIT", name)?;
        if attribute_stores.is_empty() {
            return Err(ChronicleError::Schema(format!(
                "PIT '{name}' must cover at least one attribute store"
            )));
        }
        let def = PitDef {
            name: name.to_string(),
            entity_store: entity_store.to_string(),
            attribute_stores: attribute_stores.iter().map(|s| s.to_string()).collect(),
        };
        let json = serde_json::to_string(&def)?;
        self.with_tx(|tx| {
            registry::load::<EntityStoreDef>(tx, entity_store, StoreKind::Entity)?;
            for store in attribute_stores {
                let attr: AttributeStoreDef = registry::load(tx, store, StoreKind::Attribute)?;
                if attr.entity_store != entity_store {
                    return Err(ChronicleError::Schema(format!(
                        "attribute store '{store}' does not belong to '{entity_store}'"
                    )));
                }
            }
            register_simple(tx, name, StoreKind::Pit, Some(entity_store), &json)
        })
    }

    // -----------------------------------------------------------------------
    // Store handles
    // -----------------------------------------------------------------------

    pub fn entity_store(&self, name: &str) -> ChronicleResult<EntityStore<'_>> {
        let def = self.with_conn(|conn| registry::load(conn, name, StoreKind::Entity))?;
        Ok(EntityStore::new(self, def))
    }

    pub fn attribute_store(&self, name: &str) -> ChronicleResult<AttributeStore<'_>> {
        let def = self.with_conn(|conn| registry::load(conn, name, StoreKind::Attribute))?;
        Ok(AttributeStore::new(self, def))
    }

    pub fn relationship_store(&self, name: &str) -> ChronicleResult<RelationshipStore<'_>> {
        let def = self.with_conn(|conn| registry::load(conn, name, StoreKind::Relationship))?;
        Ok(RelationshipStore::new(self, def))
    }

    pub fn validity_tracker(&self, name: &str) -> ChronicleResult<ValidityTracker<'_>> {
        let (def, relationship) = self.with_conn(|conn| {
            let def: ValidityDef = registry::load(conn, name, StoreKind::Validity)?;
            let relationship: RelationshipDefinition =
                registry::load(conn, &def.relationship_store, StoreKind::Relationship)?;
            Ok((def, relationship))
        })?;
        ValidityTracker::new(self, def, relationship)
    }

    pub fn pit(&self, name: &str) -> ChronicleResult<PitProjector<'_>> {
        let def = self.with_conn(|conn| registry::load(conn, name, StoreKind::Pit))?;
        Ok(PitProjector::new(self, def))
    }

    /// Names of all registered stores of `kind`, sorted.
    pub fn store_names(&self, kind: StoreKind) -> ChronicleResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM store_registry WHERE kind = ?1 ORDER BY name;")?;
            let names = stmt
                .query_map(params![kind.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    // -----------------------------------------------------------------------
    // Sentinels
    // -----------------------------------------------------------------------

    /// Ensure the unknown and error sentinel rows exist in `entity_store`
    /// and in every attribute store registered on it. Idempotent.
    pub fn ensure_sentinels(&self, entity_store: &str) -> ChronicleResult<SentinelSummary> {
        self.with_tx(|tx| {
            registry::load::<EntityStoreDef>(tx, entity_store, StoreKind::Entity)?;
            sentinel::ensure_sentinels_in(tx, entity_store)
        })
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    /// Copy the vault to `destination` using the SQLite backup API. Returns
    /// the resolved destination path.
    pub fn backup_to(&self, destination: impl AsRef<Path>) -> ChronicleResult<PathBuf> {
        let resolved = resolve_path(destination.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let src_conn = self.conn.lock();
        let mut dst_conn = Connection::open(&resolved)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        info!("Backed up vault to {}", resolved.display());
        Ok(resolved)
    }

    /// Replace the vault's contents with a backup file.
    pub fn restore_from(&self, source: impl AsRef<Path>) -> ChronicleResult<()> {
        let resolved = resolve_path(source.as_ref())?;
        if !resolved.exists() {
            return Err(ChronicleError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Backup file does not exist: {}", resolved.display()),
            )));
        }
        let src_conn = Connection::open(&resolved)?;
        let mut dst_conn = self.conn.lock();
        {
            let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
            backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        }
        Self::init_schema(&dst_conn)?;
        info!("Restored vault from {}", resolved.display());
        Ok(())
    }
}

fn already_registered(name: &str, kind: StoreKind) -> ChronicleError {
    ChronicleError::Schema(format!(
        "store name '{name}' is already taken by a {} store",
        kind.as_str()
    ))
}

/// Insert-or-compare registration for definitions that never evolve.
fn register_simple(
    conn: &Connection,
    name: &str,
    kind: StoreKind,
    parent: Option<&str>,
    json: &str,
) -> ChronicleResult<()> {
    match registry::lookup(conn, name)? {
        None => {
            registry::insert(conn, name, kind, parent, json, 1)?;
            info!("Registered {} store '{name}'", kind.as_str());
            Ok(())
        }
        Some(entry) if entry.kind != kind => Err(already_registered(name, entry.kind)),
        Some(entry) if entry.definition_json == json => Ok(()),
        Some(_) => Err(ChronicleError::Schema(format!(
            "{} store '{name}' is already registered with a different definition",
            kind.as_str()
        ))),
    }
}
