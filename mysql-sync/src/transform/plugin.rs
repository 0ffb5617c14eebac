//! Loads a compiled transformer plug-in and calls across the ABI
//! boundary defined in `mysql-sync-transform-abi`.
//!
//! Mirrors `pgdog-plugin`'s `Plugin::library`/`Plugin::load` split: a
//! library is opened once and kept alive for the process lifetime (the
//! plug-in's exported symbols borrow from it), and named exports are
//! looked up with `libloading::Symbol`.

use libloading::{library_filename, Library, Symbol};
use serde_json::Value;

use mysql_sync_transform_abi::{FreeFn, PdJson, TransformCtx, TransformFn};

use super::error::Error;
use crate::db::Entity;

/// A loaded transformer plug-in. Holds the symbols it needs; the
/// backing [`Library`] is leaked to `'static` by the caller so these
/// borrows remain valid for as long as the process runs (pgdog's
/// `OnceCell<Vec<Library>>` does the same for the same reason: plug-ins
/// are never unloaded mid-run).
pub struct Transformer {
    name: String,
    transform: Symbol<'static, TransformFn>,
    free: Option<Symbol<'static, FreeFn>>,
}

impl Transformer {
    /// Open `<transformer_dir>/<platform-named(table)>` and resolve its
    /// `mysync_transform`/`mysync_free` exports.
    pub fn load(dir: &std::path::Path, table: &str) -> Result<Option<Self>, Error> {
        let path = dir.join(library_filename(table));
        if !path.exists() {
            return Ok(None);
        }

        let library = unsafe { Library::new(&path) }.map_err(|e| Error::Load(table.to_string(), e))?;
        let library: &'static Library = Box::leak(Box::new(library));

        let transform: Symbol<'static, TransformFn> = unsafe { library.get(b"mysync_transform\0") }
            .map_err(|e| Error::Load(table.to_string(), e))?;
        let free: Option<Symbol<'static, FreeFn>> = unsafe { library.get(b"mysync_free\0") }.ok();

        Ok(Some(Self {
            name: table.to_string(),
            transform,
            free,
        }))
    }

    /// Apply the plug-in to `entity`, returning the transformed entity
    /// (`None` means "delete this row").
    pub fn call(
        &self,
        source: &str,
        target: &str,
        table: &str,
        id: &str,
        entity: Option<&Entity>,
    ) -> Result<Option<Entity>, Error> {
        let entity_json = match entity {
            Some(e) => serde_json::to_string(e).expect("Entity always serializes"),
            None => String::new(),
        };

        let ctx = TransformCtx {
            source: PdJson::from(&source.to_string()),
            target: PdJson::from(&target.to_string()),
            table: PdJson::from(&table.to_string()),
            id: PdJson::from(&id.to_string()),
            entity: if entity.is_some() {
                PdJson::from(&entity_json)
            } else {
                PdJson::null()
            },
        };

        let result: PdJson = unsafe { (self.transform)(ctx) };

        let decoded = if result.is_null != 0 {
            None
        } else {
            let raw = unsafe { result.as_str() }.map(|s| s.to_string());
            match raw {
                Some(raw) => {
                    let value: Value =
                        serde_json::from_str(&raw).map_err(|e| Error::Decode(self.name.clone(), e))?;
                    match value {
                        Value::Object(map) => Some(map.into_iter().collect()),
                        Value::Null => None,
                        _ => None,
                    }
                }
                None => None,
            }
        };

        if let Some(free) = &self.free {
            unsafe { free(result) };
        }

        Ok(decoded)
    }
}
