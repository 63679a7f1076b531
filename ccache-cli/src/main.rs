//! Command-line glue around `ccache-core` and `ccache-archivefs`: init/sync
//! a cache directory against a repository, print its stats, or mount one of
//! its archives read-only via FUSE. Argument parsing, logging setup and
//! process wiring here are the "surrounding glue" the cache and
//! materializer crates themselves stay free of.

mod key;
mod repository;

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use proxmox_router::cli::*;
use proxmox_schema::api;

use ccache_archivefs::{fuse_session, Materializer};
use ccache_core::{Cache, Manifest};
use ccache_types::{ChunkId, Key, Repository};

use key::PassphraseKey;
use repository::FsRepository;

/// Fetches and decodes the repository's manifest, returning its own
/// id_hash alongside the decoded value (`Cache::ensure_synced` identifies
/// manifests by that hash, not by the well-known storage slot).
fn fetch_manifest(
    repository: &FsRepository,
    key: &PassphraseKey,
) -> Result<(ChunkId, Manifest), Error> {
    let ciphertext = repository.get(&ChunkId::MANIFEST)?;
    let plaintext = key
        .decrypt(&ChunkId::MANIFEST, &ciphertext)
        .map_err(|err| format_err!("manifest failed to decrypt: {}", err))?;
    let manifest_id = key.id_hash(&plaintext);
    let manifest = Manifest::decode(&plaintext)?;
    Ok((manifest_id, manifest))
}

#[api(
    input: {
        properties: {
            "cache-dir": { description: "Path to the cache directory to create." },
            "repo-dir": { description: "Path to the (file-system backed) repository." },
        },
    },
)]
/// Create a new, empty cache directory bound to a repository.
fn init(cache_dir: String, repo_dir: String) -> Result<(), Error> {
    let repository = FsRepository::open(PathBuf::from(repo_dir))?;
    Cache::<FsRepository, PassphraseKey>::create(Path::new(&cache_dir), repository.id())?;
    log::info!("created cache at {}", cache_dir);
    Ok(())
}

#[api(
    input: {
        properties: {
            "cache-dir": { description: "Path to the cache directory." },
            "repo-dir": { description: "Path to the (file-system backed) repository." },
            passphrase: { description: "Passphrase the repository was encrypted with." },
        },
    },
)]
/// Bring the cache's chunk index up to date with the repository's manifest.
fn sync(cache_dir: String, repo_dir: String, passphrase: String) -> Result<(), Error> {
    let repository = FsRepository::open(PathBuf::from(repo_dir))?;
    let key = PassphraseKey::derive(&passphrase);
    let mut cache = Cache::open(PathBuf::from(cache_dir), repository, key, true)?;

    let (manifest_id, manifest) = fetch_manifest(cache.repository(), cache.key())?;
    cache.ensure_synced(manifest_id, &manifest)?;

    let stats = cache.stats();
    log::info!(
        "synced: {} unique chunks, {} total chunks, dedup factor {:.2}",
        stats.total_unique_chunks,
        stats.total_chunks,
        stats.deduplication_factor()
    );
    Ok(())
}

#[api(
    input: {
        properties: {
            "cache-dir": { description: "Path to the cache directory." },
            "repo-dir": { description: "Path to the (file-system backed) repository." },
        },
    },
)]
/// Print the cache's running statistics.
fn stats(cache_dir: String, repo_dir: String) -> Result<(), Error> {
    // `Cache::open` never contacts the repository itself; it's only needed
    // here to satisfy the type the cache is generic over.
    let repository = FsRepository::open(PathBuf::from(repo_dir))?;
    let key = PassphraseKey::derive("");
    let cache = Cache::open(PathBuf::from(cache_dir), repository, key, true)?;

    let stats = cache.stats();
    println!("unique chunks:     {}", stats.total_unique_chunks);
    println!("total chunks:      {}", stats.total_chunks);
    println!("unique size:       {}", stats.unique_size);
    println!("total size:        {}", stats.total_size);
    println!("dedup factor:      {:.2}", stats.deduplication_factor());
    println!("compression factor:{:.2}", stats.compression_factor());
    Ok(())
}

#[api(
    input: {
        properties: {
            "repo-dir": { description: "Path to the (file-system backed) repository." },
            passphrase: { description: "Passphrase the repository was encrypted with." },
            archive: { description: "Archive name, as listed in the repository manifest." },
            mountpoint: { description: "Directory to mount the archive's contents at." },
        },
    },
)]
/// Mount one archive read-only via FUSE, resolving directories and files
/// lazily as they are traversed.
async fn mount(
    repo_dir: String,
    passphrase: String,
    archive: String,
    mountpoint: String,
) -> Result<(), Error> {
    let repository = FsRepository::open(PathBuf::from(repo_dir))?;
    let key = PassphraseKey::derive(&passphrase);

    let (_manifest_id, manifest) = fetch_manifest(&repository, &key)?;
    let info = manifest
        .archives
        .get(&archive)
        .ok_or_else(|| format_err!("no such archive {:?} in manifest", archive))?;

    let mut materializer = Materializer::new(repository, key);
    materializer.add_archive(&archive, info.id);

    fuse_session::run(materializer, Path::new(&mountpoint), "").await
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime")
}

fn main() {
    init_cli_logger("CCACHE_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "init",
            CliCommand::new(&API_METHOD_INIT).arg_param(&["cache-dir", "repo-dir"]),
        )
        .insert(
            "sync",
            CliCommand::new(&API_METHOD_SYNC).arg_param(&["cache-dir", "repo-dir", "passphrase"]),
        )
        .insert(
            "stats",
            CliCommand::new(&API_METHOD_STATS).arg_param(&["cache-dir", "repo-dir"]),
        )
        .insert(
            "mount",
            CliCommand::new(&API_METHOD_MOUNT)
                .arg_param(&["repo-dir", "passphrase", "archive", "mountpoint"]),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| runtime().block_on(future)),
    );
}
