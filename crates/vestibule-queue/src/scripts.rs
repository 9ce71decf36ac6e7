//! Embedded server-side scripts.
//!
//! Each Lua file under `redis_functions/` mutates the queue/store keys of
//! one prefix as a single indivisible unit; the scripts are the only
//! permitted mutators of admission state. They are compiled into the binary
//! and registered by SHA1 digest on startup; `redis::Script` invokes by
//! digest and transparently re-registers after a `NOSCRIPT` reply (a flushed
//! script cache), retrying the call once.

use deadpool_redis::Connection;
use include_dir::{include_dir, Dir};
use redis::Script;

use vestibule_core::error::{Error, Result};

static REDIS_FUNCTIONS_DIR: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/redis_functions");

/// The atomic state scripts, parsed and ready to invoke.
pub(crate) struct Scripts {
    pub check_sync_keys: Script,
    pub has_ids: Script,
    pub id_add: Script,
    pub id_position: Script,
    pub id_promote: Script,
    pub id_remove: Script,
    pub queue_timeout: Script,
    pub store_promote: Script,
    pub store_promote_n: Script,
    pub store_timeout: Script,
}

impl Scripts {
    /// Load a single embedded script by name.
    fn read(name: &str) -> Result<Script> {
        let file_name = format!("{name}.lua");
        let Some(file) = REDIS_FUNCTIONS_DIR.get_file(file_name) else {
            return Err(Error::ScriptMissing {
                script: String::from(name),
            });
        };
        let Some(contents) = file.contents_utf8() else {
            return Err(Error::ScriptMissing {
                script: String::from(name),
            });
        };
        Ok(Script::new(contents))
    }

    /// Parse every embedded script.
    pub fn new() -> Result<Self> {
        Ok(Self {
            check_sync_keys: Self::read("check_sync_keys")?,
            has_ids: Self::read("has_ids")?,
            id_add: Self::read("id_add")?,
            id_position: Self::read("id_position")?,
            id_promote: Self::read("id_promote")?,
            id_remove: Self::read("id_remove")?,
            queue_timeout: Self::read("queue_timeout")?,
            store_promote: Self::read("store_promote")?,
            store_promote_n: Self::read("store_promote_n")?,
            store_timeout: Self::read("store_timeout")?,
        })
    }

    /// Register every script with the server so later calls can invoke by
    /// digest without shipping the source.
    pub async fn register(&self, conn: &mut Connection) -> Result<()> {
        for script in [
            &self.check_sync_keys,
            &self.has_ids,
            &self.id_add,
            &self.id_position,
            &self.id_promote,
            &self.id_remove,
            &self.queue_timeout,
            &self.store_promote,
            &self.store_promote_n,
            &self.store_timeout,
        ] {
            script
                .prepare_invoke()
                .load_async(conn)
                .await
                .map_err(|e| Error::transport_with_source("script registration failed", e))?;
        }
        Ok(())
    }
}
