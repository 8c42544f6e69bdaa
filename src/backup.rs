use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::{self, DB_FILE_NAME};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/campus.sqlite3";
pub const BUNDLE_FORMAT: &str = "campusd-workspace-v1";
pub const RAW_SQLITE_FORMAT: &str = "raw-sqlite3";

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub format: String,
    pub app_version: String,
    pub exported_at: String,
    #[serde(default)]
    pub user_count: i64,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub manifest: BundleManifest,
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub format_detected: String,
    pub exported_at: Option<String>,
}

/// Writes `manifest.json` plus the workspace database into a zip at `out_path`.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    user_count: i64,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        bail!("workspace database not found: {}", db_path.display());
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create bundle {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = BundleManifest {
        format: BUNDLE_FORMAT.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: db::now_ts(),
        user_count,
    };
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())
        .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    let file = zip.finish().context("failed to finalize bundle")?;
    let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok(ExportSummary {
        manifest,
        bytes_written,
    })
}

/// Replaces the workspace database with the one in `in_path`.
///
/// Accepts either a bundle written by [`export_workspace_bundle`] or a bare
/// SQLite file. The extracted database is checked before the live file is
/// swapped, so a bad input leaves the workspace untouched. The caller must
/// drop its open connection first.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create workspace {}", workspace_path.display()))?;
    let dst = workspace_path.join(DB_FILE_NAME);
    let staging = workspace_path.join(format!("{}.importing", DB_FILE_NAME));
    if staging.exists() {
        std::fs::remove_file(&staging)
            .with_context(|| format!("failed to clear {}", staging.display()))?;
    }

    let sig = read_signature(in_path)?;
    let summary = if sig[..4] == ZIP_MAGIC {
        extract_bundle(in_path, &staging)?
    } else if &sig == SQLITE_MAGIC {
        std::fs::copy(in_path, &staging)
            .with_context(|| format!("failed to copy {}", in_path.display()))?;
        ImportSummary {
            format_detected: RAW_SQLITE_FORMAT.to_string(),
            exported_at: None,
        }
    } else {
        bail!("{} is neither a workspace bundle nor a SQLite database", in_path.display());
    };

    if let Err(e) = check_campus_db(&staging) {
        let _ = std::fs::remove_file(&staging);
        return Err(e);
    }
    if dst.exists() {
        std::fs::remove_file(&dst)
            .with_context(|| format!("failed to remove existing database {}", dst.display()))?;
    }
    std::fs::rename(&staging, &dst)
        .with_context(|| format!("failed to move imported database to {}", dst.display()))?;
    Ok(summary)
}

fn extract_bundle(in_path: &Path, staging: &Path) -> anyhow::Result<ImportSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: BundleManifest =
        serde_json::from_str(&manifest_text).context("manifest.json is malformed")?;
    if manifest.format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", manifest.format));
    }

    let mut out = File::create(staging)
        .with_context(|| format!("failed to create {}", staging.display()))?;
    {
        let mut entry = archive
            .by_name(DB_ENTRY)
            .with_context(|| format!("bundle missing {}", DB_ENTRY))?;
        std::io::copy(&mut entry, &mut out).context("failed to extract database entry")?;
    }
    out.flush().context("failed to flush extracted database")?;
    Ok(ImportSummary {
        format_detected: manifest.format,
        exported_at: Some(manifest.exported_at),
    })
}

fn read_signature(path: &Path) -> anyhow::Result<[u8; 16]> {
    let mut f = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut sig = [0u8; 16];
    let mut filled = 0;
    while filled < sig.len() {
        let n = f.read(&mut sig[filled..]).context("failed to read file signature")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(sig)
}

fn check_campus_db(path: &Path) -> anyhow::Result<()> {
    let conn = rusqlite::Connection::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let has_users: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'users'",
            [],
            |r| r.get(0),
        )
        .context("imported file is not a readable SQLite database")?;
    if has_users == 0 {
        bail!("imported database has no users table");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        db::settings_set_json(&conn, "institution.name", &serde_json::json!("Bundle Test"))
            .expect("seed");
        dir
    }

    #[test]
    fn bundle_round_trips_database() {
        let src = seeded_workspace();
        let out = tempfile::tempdir().expect("tempdir");
        let bundle = out.path().join("nested").join("backup.zip");
        let summary = export_workspace_bundle(src.path(), 0, &bundle).expect("export");
        assert_eq!(summary.manifest.format, BUNDLE_FORMAT);
        assert!(summary.bytes_written > 0);

        let dst = tempfile::tempdir().expect("tempdir");
        let imported = import_workspace_bundle(&bundle, dst.path()).expect("import");
        assert_eq!(imported.format_detected, BUNDLE_FORMAT);
        assert!(imported.exported_at.is_some());

        let conn = db::open_db(dst.path()).expect("reopen");
        assert_eq!(
            db::settings_get_json(&conn, "institution.name").expect("get"),
            Some(serde_json::json!("Bundle Test"))
        );
        assert!(!dst.path().join("campus.sqlite3.importing").exists());
    }

    #[test]
    fn raw_sqlite_file_is_accepted() {
        let src = seeded_workspace();
        let dst = tempfile::tempdir().expect("tempdir");
        let imported =
            import_workspace_bundle(&src.path().join(DB_FILE_NAME), dst.path()).expect("import");
        assert_eq!(imported.format_detected, RAW_SQLITE_FORMAT);
        assert!(dst.path().join(DB_FILE_NAME).is_file());
    }

    #[test]
    fn garbage_input_leaves_workspace_untouched() {
        let ws = seeded_workspace();
        let junk = ws.path().join("junk.bin");
        std::fs::write(&junk, b"definitely not a backup").expect("write");
        let err = import_workspace_bundle(&junk, ws.path()).expect_err("should reject");
        assert!(err.to_string().contains("neither"));

        let conn = db::open_db(ws.path()).expect("reopen");
        assert!(db::settings_get_json(&conn, "institution.name")
            .expect("get")
            .is_some());
    }
}
