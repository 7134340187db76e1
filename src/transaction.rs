// src/transaction.rs

//! Step pipeline orchestrator
//!
//! One transaction drives one action (fetch, multi-fetch, install, remove,
//! config, source) through an immutable step list computed at prepare
//! time. Each step returns an integer: 0 continues, anything else aborts
//! the transaction and is returned to the caller unmodified. The whole
//! pipeline runs under the exclusive process resource lock, released on
//! every exit path. Two pre-steps short-circuit everything: a vanished
//! target and an unavailable download are informational no-ops.

use crate::codes;
use crate::content::{
    ContentReader, EntryType, filter_content_file, generate_content_file, merge_content_file,
};
use crate::delta::best_installed;
use crate::download::DownloadCoordinator;
use crate::error::Result;
use crate::hooks::{HookPhase, PackageHooks};
use crate::install::Installer;
use crate::lock::ResourceLock;
use crate::mirrors::MirrorStatus;
use crate::protect::ProtectSets;
use crate::remove::Remover;
use crate::repository::{DownloadDescriptor, PackageData, PackageId, Repository};
use crate::settings::ClientSettings;
use crate::transport::{AbortCheck, FetchStatus, Transport};
use crate::unpack::unpack_package;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Attempts and pause while waiting for the resource lock
const LOCK_ATTEMPTS: u32 = 20;
const LOCK_DELAY: Duration = Duration::from_millis(500);

fn never_abort() -> bool {
    false
}
static NEVER_ABORT: fn() -> bool = never_abort;

/// Supported transaction actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Fetch,
    MultiFetch,
    Install,
    Remove,
    RemoveConflict,
    Config,
    Source,
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Fetch => "fetch",
            ActionKind::MultiFetch => "multi_fetch",
            ActionKind::Install => "install",
            ActionKind::Remove => "remove",
            ActionKind::RemoveConflict => "remove_conflict",
            ActionKind::Config => "config",
            ActionKind::Source => "source",
        }
    }
}

/// Named pipeline phases, dispatched exhaustively
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fetch,
    Checksum,
    MultiFetch,
    MultiChecksum,
    SourcesFetch,
    Unpack,
    RemoveConflicts,
    Setup,
    Preinstall,
    Install,
    Preremove,
    InstallClean,
    Postremove,
    PostremoveInstall,
    InstallRegister,
    Postinstall,
    Cleanup,
    Remove,
    PostremoveRemove,
    Config,
}

/// Caller-supplied knobs for one action
#[derive(Debug, Clone)]
pub struct ActionOptions {
    /// Download into this directory instead of the standard packages dir
    pub fetch_path: Option<PathBuf>,
    /// Remove config files too, bypassing protection
    pub remove_config: bool,
    /// Resume partial downloads
    pub resume: bool,
    /// Installed packages conflicting with an install, computed by the
    /// external resolver; removed before the image merge
    pub conflict_package_ids: Vec<PackageId>,
    /// Source tarball URLs for the source action
    pub source_urls: Vec<String>,
}

impl Default for ActionOptions {
    fn default() -> Self {
        Self {
            fetch_path: None,
            remove_config: false,
            resume: true,
            conflict_package_ids: Vec::new(),
            source_urls: Vec::new(),
        }
    }
}

/// Identity shared by every context variant
#[derive(Debug, Clone)]
pub struct ContextBase {
    pub package_id: PackageId,
    pub repository_id: String,
    pub atom: String,
}

#[derive(Debug)]
pub struct FetchContext {
    pub base: ContextBase,
    pub descriptors: Vec<DownloadDescriptor>,
    pub fetch_path: Option<PathBuf>,
    /// The repository carries no download for this package
    pub fetch_not_available: bool,
}

#[derive(Debug)]
pub struct MultiFetchContext {
    pub descriptors: Vec<DownloadDescriptor>,
}

#[derive(Debug)]
pub struct InstallContext {
    pub base: ContextBase,
    pub descriptors: Vec<DownloadDescriptor>,
    pub unpack_dir: PathBuf,
    pub image_dir: PathBuf,
    /// Installed package this one replaces, if any
    pub remove_package_id: Option<PackageId>,
    pub remove_atom: Option<String>,
    /// Automerge digests recorded when the replaced package was installed
    pub already_protected: HashMap<String, String>,
    /// Protection metadata of the replaced package, captured before its
    /// repository entry goes away
    pub old_protect: ProtectSets,
    pub removecontent_file: Option<PathBuf>,
    pub installed_package_id: Option<PackageId>,
}

#[derive(Debug)]
pub struct RemoveContext {
    pub base: ContextBase,
    pub removecontent_file: Option<PathBuf>,
    pub automerge: HashMap<String, String>,
    pub protect: ProtectSets,
    /// The installed package disappeared while the action was queued
    pub vanished: bool,
    pub remove_config: bool,
}

#[derive(Debug)]
pub struct ConfigContext {
    pub base: ContextBase,
}

#[derive(Debug)]
pub struct SourceContext {
    pub base: ContextBase,
    pub urls: Vec<String>,
    pub fetch_path: Option<PathBuf>,
}

/// Per-action transaction metadata
#[derive(Debug)]
pub enum TransactionContext {
    Fetch(FetchContext),
    MultiFetch(MultiFetchContext),
    Install(InstallContext),
    Remove(RemoveContext),
    Config(ConfigContext),
    Source(SourceContext),
}

/// Builds prepared transactions around one set of collaborators
pub struct TransactionFactory<'a> {
    pub settings: &'a ClientSettings,
    pub transport: &'a dyn Transport,
    pub hooks: &'a dyn PackageHooks,
    pub installed: &'a dyn Repository,
    pub status: &'a MirrorStatus,
}

impl<'a> TransactionFactory<'a> {
    /// Prepare a single-package action. For remove/config actions pass the
    /// installed repository as `repository`.
    pub fn prepare(
        &self,
        kind: ActionKind,
        repository: &'a dyn Repository,
        package_id: PackageId,
        opts: ActionOptions,
    ) -> Result<Transaction<'a>> {
        Transaction::prepare(
            kind,
            repository,
            package_id,
            opts,
            self.settings,
            self.transport,
            self.hooks,
            self.installed,
            self.status,
        )
    }

    /// Prepare a batch fetch of several packages from one repository
    pub fn prepare_multi_fetch(
        &self,
        repository: &'a dyn Repository,
        package_ids: &[PackageId],
        opts: ActionOptions,
    ) -> Result<Transaction<'a>> {
        let mut descriptors = Vec::new();
        for &package_id in package_ids {
            descriptors.extend(build_descriptors(
                self.settings,
                repository,
                package_id,
            )?);
        }
        let steps = if descriptors.is_empty() {
            Vec::new()
        } else {
            vec![Step::MultiFetch, Step::MultiChecksum]
        };
        Ok(Transaction {
            kind: ActionKind::MultiFetch,
            context: TransactionContext::MultiFetch(MultiFetchContext { descriptors }),
            steps,
            opts,
            settings: self.settings,
            transport: self.transport,
            hooks: self.hooks,
            installed: self.installed,
            status: self.status,
            repository,
            temp_files: Vec::new(),
            abort: None,
        })
    }
}

/// Base + extra download descriptors for one package, with split-debug
/// payloads dropped when splitdebug is disabled
fn build_descriptors(
    settings: &ClientSettings,
    repository: &dyn Repository,
    package_id: PackageId,
) -> Result<Vec<DownloadDescriptor>> {
    let mut descriptors = vec![DownloadDescriptor {
        package_id,
        repository_id: repository.name().to_string(),
        download: repository.download_url(package_id)?,
        digest: repository.digest(package_id)?,
        signatures: repository.signatures(package_id)?,
    }];
    for extra in repository.extra_downloads(package_id)? {
        if !settings.splitdebug && extra.kind == "debug" {
            continue;
        }
        descriptors.push(DownloadDescriptor {
            package_id,
            repository_id: repository.name().to_string(),
            download: extra.download,
            digest: extra.digest,
            signatures: extra.signatures,
        });
    }
    Ok(descriptors)
}

/// Field separators upset some tools; keep them out of scratch paths
fn escape_path(atom: &str) -> String {
    atom.replace([':', '~'], "_")
}

/// One prepared action over one package (or package set)
pub struct Transaction<'a> {
    kind: ActionKind,
    context: TransactionContext,
    steps: Vec<Step>,
    opts: ActionOptions,
    settings: &'a ClientSettings,
    transport: &'a dyn Transport,
    hooks: &'a dyn PackageHooks,
    installed: &'a dyn Repository,
    status: &'a MirrorStatus,
    repository: &'a dyn Repository,
    temp_files: Vec<PathBuf>,
    abort: Option<&'a (dyn Fn() -> bool + Sync)>,
}

impl<'a> Transaction<'a> {
    #[allow(clippy::too_many_arguments)]
    fn prepare(
        kind: ActionKind,
        repository: &'a dyn Repository,
        package_id: PackageId,
        opts: ActionOptions,
        settings: &'a ClientSettings,
        transport: &'a dyn Transport,
        hooks: &'a dyn PackageHooks,
        installed: &'a dyn Repository,
        status: &'a MirrorStatus,
    ) -> Result<Transaction<'a>> {
        let mut transaction = Transaction {
            kind,
            context: TransactionContext::Config(ConfigContext {
                base: ContextBase {
                    package_id,
                    repository_id: repository.name().to_string(),
                    atom: String::new(),
                },
            }),
            steps: Vec::new(),
            opts,
            settings,
            transport,
            hooks,
            installed,
            status,
            repository,
            temp_files: Vec::new(),
            abort: None,
        };
        transaction.setup(package_id)?;
        Ok(transaction)
    }

    /// Compute the context and the immutable step list
    fn setup(&mut self, package_id: PackageId) -> Result<()> {
        let repository_id = self.repository.name().to_string();
        let base = move |atom: String| ContextBase {
            package_id,
            repository_id: repository_id.clone(),
            atom,
        };

        match self.kind {
            ActionKind::Fetch => {
                let download = self.repository.download_url(package_id)?;
                if download.is_empty() {
                    self.context = TransactionContext::Fetch(FetchContext {
                        base: base(self.repository.atom(package_id)?),
                        descriptors: Vec::new(),
                        fetch_path: self.opts.fetch_path.clone(),
                        fetch_not_available: true,
                    });
                    return Ok(());
                }
                self.context = TransactionContext::Fetch(FetchContext {
                    base: base(self.repository.atom(package_id)?),
                    descriptors: build_descriptors(self.settings, self.repository, package_id)?,
                    fetch_path: self.opts.fetch_path.clone(),
                    fetch_not_available: false,
                });
                self.steps = vec![Step::Fetch, Step::Checksum];
            }

            ActionKind::MultiFetch => {
                return Err(crate::error::Error::InitError(
                    "multi_fetch requires prepare_multi_fetch".to_string(),
                ));
            }

            ActionKind::Source => {
                self.context = TransactionContext::Source(SourceContext {
                    base: base(self.repository.atom(package_id)?),
                    urls: self.opts.source_urls.clone(),
                    fetch_path: self.opts.fetch_path.clone(),
                });
                self.steps = vec![Step::SourcesFetch];
            }

            ActionKind::Remove | ActionKind::RemoveConflict => {
                if !self.installed.is_package_available(package_id)? {
                    self.context = TransactionContext::Remove(RemoveContext {
                        base: base(String::new()),
                        removecontent_file: None,
                        automerge: HashMap::new(),
                        protect: ProtectSets::default(),
                        vanished: true,
                        remove_config: self.opts.remove_config,
                    });
                    return Ok(());
                }

                let atom = self.installed.atom(package_id)?;
                let protect = ProtectSets::assemble(
                    self.settings,
                    &self.installed.config_protect(package_id)?,
                    &self.installed.config_protect_mask(package_id)?,
                );
                let content = self.installed.content(package_id, true)?;
                let ledger = generate_content_file(
                    content,
                    Some(package_id),
                    false,
                    self.settings.splitdebug,
                    &self.settings.splitdebug_dirs,
                    &self.ledger_dir(),
                )?;
                self.temp_files.push(ledger.clone());

                self.context = TransactionContext::Remove(RemoveContext {
                    base: base(atom),
                    removecontent_file: Some(ledger),
                    automerge: self.installed.automerge_map(package_id)?,
                    protect,
                    vanished: false,
                    remove_config: self.opts.remove_config,
                });
                self.steps = vec![
                    Step::Preremove,
                    Step::Remove,
                    Step::Postremove,
                    Step::PostremoveRemove,
                ];
            }

            ActionKind::Config => {
                self.context = TransactionContext::Config(ConfigContext {
                    base: base(self.installed.atom(package_id)?),
                });
                self.steps = vec![Step::Config];
            }

            ActionKind::Install => {
                let atom = self.repository.atom(package_id)?;
                let descriptors =
                    build_descriptors(self.settings, self.repository, package_id)?;

                let scratch = self
                    .settings
                    .unpack_dir
                    .join(escape_path(&atom).trim_start_matches('/'));
                fs::create_dir_all(&scratch)?;
                let unpack_dir = tempfile::Builder::new()
                    .tempdir_in(&scratch)
                    .map_err(crate::error::Error::Io)?
                    .keep();
                let image_dir = unpack_dir.join("image");

                // find the installed package this one replaces
                let remove_package_id = match self.repository.key_slot(package_id)? {
                    Some(key_slot) => {
                        let ids = self.installed.search_key_slot(&key_slot)?;
                        best_installed(self.installed, &ids)
                    }
                    None => None,
                };

                let (remove_atom, already_protected, old_protect) = match remove_package_id {
                    Some(id) => (
                        Some(self.installed.atom(id)?),
                        self.installed.automerge_map(id)?,
                        ProtectSets::assemble(
                            self.settings,
                            &self.installed.config_protect(id)?,
                            &self.installed.config_protect_mask(id)?,
                        ),
                    ),
                    None => (None, HashMap::new(), ProtectSets::default()),
                };

                let package_missing = descriptors
                    .iter()
                    .any(|d| !self.settings.fetch_disk_path(&d.download).is_file());

                let mut steps = vec![Step::RemoveConflicts];
                if package_missing {
                    steps.push(Step::Fetch);
                }
                steps.push(Step::Checksum);
                steps.push(Step::Unpack);
                steps.push(Step::Setup);
                steps.push(Step::Preinstall);
                steps.push(Step::Install);
                if remove_package_id.is_some() {
                    steps.push(Step::Preremove);
                }
                steps.push(Step::InstallClean);
                if remove_package_id.is_some() {
                    steps.push(Step::Postremove);
                    steps.push(Step::PostremoveInstall);
                }
                steps.push(Step::InstallRegister);
                steps.push(Step::Postinstall);
                steps.push(Step::Cleanup);
                self.steps = steps;

                self.context = TransactionContext::Install(InstallContext {
                    base: base(atom),
                    descriptors,
                    unpack_dir,
                    image_dir,
                    remove_package_id,
                    remove_atom,
                    already_protected,
                    old_protect,
                    removecontent_file: None,
                    installed_package_id: None,
                });
            }
        }
        Ok(())
    }

    /// Scratch directory for temporary ledger files
    fn ledger_dir(&self) -> PathBuf {
        self.settings.unpack_dir.join("ledgers")
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    /// Package id of the newly installed package, once the install step ran
    pub fn installed_package_id(&self) -> Option<PackageId> {
        match &self.context {
            TransactionContext::Install(ctx) => ctx.installed_package_id,
            _ => None,
        }
    }

    /// Install an operator-interrupt check, polled between transfer chunks
    pub fn set_abort_check(&mut self, abort: &'a (dyn Fn() -> bool + Sync)) {
        self.abort = Some(abort);
    }

    fn abort_check(&self) -> AbortCheck<'_> {
        self.abort.unwrap_or(&NEVER_ABORT)
    }

    fn coordinator(&self) -> DownloadCoordinator<'_> {
        DownloadCoordinator {
            settings: self.settings,
            transport: self.transport,
            repository: self.repository,
            installed: self.installed,
            status: self.status,
        }
    }

    /// Execute the action under the exclusive resource lock. Returns an
    /// exit status; nonzero aborted the pipeline.
    pub fn run(&mut self) -> i32 {
        let guard =
            match ResourceLock::acquire_with_timeout(&self.settings.lock_path, LOCK_ATTEMPTS, LOCK_DELAY)
            {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    warn!("resource lock busy, giving up");
                    return codes::LOCK_UNAVAILABLE;
                }
                Err(err) => {
                    warn!("cannot acquire resource lock: {}", err);
                    return codes::LOCK_UNAVAILABLE;
                }
            };

        let exit_st = self.run_steps();
        drop(guard);

        if exit_st != codes::OK {
            error!("an error occurred, action aborted (code {})", exit_st);
        }
        exit_st
    }

    /// Run the step list without touching the resource lock; used by
    /// nested transactions that already hold it.
    fn run_steps(&mut self) -> i32 {
        match &self.context {
            TransactionContext::Remove(ctx) if ctx.vanished => {
                info!("installed package in queue vanished, skipping");
                return codes::OK;
            }
            TransactionContext::Fetch(ctx) if ctx.fetch_not_available => {
                info!("package cannot be downloaded, unknown error");
                return codes::OK;
            }
            _ => {}
        }

        for step in self.steps.clone() {
            let exit_st = self.execute_step(step);
            if exit_st != codes::OK {
                return exit_st;
            }
        }
        codes::OK
    }

    fn execute_step(&mut self, step: Step) -> i32 {
        match step {
            Step::Fetch => self.do_fetch(),
            Step::Checksum => self.do_checksum(),
            Step::MultiFetch => self.do_multi_fetch(),
            Step::MultiChecksum => self.do_multi_checksum(),
            Step::SourcesFetch => self.do_sources_fetch(),
            Step::Unpack => self.do_unpack(),
            Step::RemoveConflicts => self.do_remove_conflicts(),
            Step::Setup => self.do_hook_phase(HookPhase::Setup),
            Step::Preinstall => self.do_hook_phase(HookPhase::Preinstall),
            Step::Install => self.fallible(Self::do_install),
            Step::Preremove => self.do_hook_phase(HookPhase::Preremove),
            Step::InstallClean => self.fallible(Self::do_install_clean),
            Step::Postremove => self.do_hook_phase(HookPhase::Postremove),
            Step::PostremoveInstall => self.do_postremove_install(),
            Step::InstallRegister => self.do_install_register(),
            Step::Postinstall => self.do_hook_phase(HookPhase::Postinstall),
            Step::Cleanup => self.do_cleanup(),
            Step::Remove => self.fallible(Self::do_remove),
            Step::PostremoveRemove => self.do_postremove_remove(),
            Step::Config => self.do_hook_phase(HookPhase::Configure),
        }
    }

    fn fallible(&mut self, f: fn(&mut Self) -> Result<i32>) -> i32 {
        match f(self) {
            Ok(code) => code,
            Err(err) => {
                warn!("step failed: {}", err);
                codes::FAILED
            }
        }
    }

    fn atom(&self) -> &str {
        match &self.context {
            TransactionContext::Fetch(ctx) => &ctx.base.atom,
            TransactionContext::MultiFetch(_) => "",
            TransactionContext::Install(ctx) => &ctx.base.atom,
            TransactionContext::Remove(ctx) => &ctx.base.atom,
            TransactionContext::Config(ctx) => &ctx.base.atom,
            TransactionContext::Source(ctx) => &ctx.base.atom,
        }
    }

    fn do_hook_phase(&mut self, phase: HookPhase) -> i32 {
        self.hooks.execute_phase(phase, self.atom())
    }

    /// Download path for one descriptor, honoring a fetch-path override
    fn download_path_for(&self, descriptor: &DownloadDescriptor) -> PathBuf {
        let override_dir = match &self.context {
            TransactionContext::Fetch(ctx) => ctx.fetch_path.as_deref(),
            _ => None,
        };
        match override_dir {
            Some(dir) => {
                let name = Path::new(&descriptor.download)
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(&descriptor.download));
                dir.join(name)
            }
            None => self.settings.fetch_disk_path(&descriptor.download),
        }
    }

    fn descriptors(&self) -> Vec<DownloadDescriptor> {
        match &self.context {
            TransactionContext::Fetch(ctx) => ctx.descriptors.clone(),
            TransactionContext::MultiFetch(ctx) => ctx.descriptors.clone(),
            TransactionContext::Install(ctx) => ctx.descriptors.clone(),
            _ => Vec::new(),
        }
    }

    fn do_fetch(&mut self) -> i32 {
        info!("downloading: {}", self.atom());
        let coordinator = self.coordinator();
        for descriptor in self.descriptors() {
            let path = self.download_path_for(&descriptor);
            if path.is_file() {
                continue;
            }
            let exit_st = coordinator.download_package(
                descriptor.package_id,
                &descriptor.download,
                &path,
                &descriptor.digest,
                self.opts.resume,
                self.abort_check(),
            );
            if exit_st != codes::OK {
                return exit_st;
            }
        }
        codes::OK
    }

    fn do_checksum(&mut self) -> i32 {
        let coordinator = self.coordinator();
        for descriptor in self.descriptors() {
            let path = self.download_path_for(&descriptor);
            let exit_st =
                coordinator.fetch_and_verify(&descriptor, &path, self.opts.resume, self.abort_check());
            if exit_st != codes::OK {
                warn!(
                    "package cannot be verified, try to update repositories (code {})",
                    exit_st
                );
                return exit_st;
            }
        }
        codes::OK
    }

    fn do_multi_fetch(&mut self) -> i32 {
        let descriptors = self.descriptors();
        info!("downloading {} packages", descriptors.len());
        let coordinator = self.coordinator();
        let (exit_st, pending) =
            coordinator.download_packages(&descriptors, self.opts.resume, self.abort_check());
        if exit_st != codes::OK {
            warn!("some packages cannot be fetched (code {})", exit_st);
            for descriptor in &pending {
                warn!("[{}] {}", descriptor.repository_id, descriptor.download);
            }
        }
        exit_st
    }

    fn do_multi_checksum(&mut self) -> i32 {
        self.do_checksum()
    }

    fn do_sources_fetch(&mut self) -> i32 {
        let TransactionContext::Source(ctx) = &self.context else {
            return codes::OK;
        };
        let dest_dir = ctx.fetch_path.clone().unwrap_or_else(|| {
            self.settings
                .unpack_dir
                .join("sources")
                .join(escape_path(&ctx.base.atom).trim_start_matches('/'))
        });
        if let Err(err) = fs::create_dir_all(&dest_dir) {
            warn!("cannot create sources directory: {}", err);
            return codes::FETCH_IO_ERROR;
        }

        for url in ctx.urls.clone() {
            let name = url.rsplit('/').next().unwrap_or(&url).to_string();
            let dest = dest_dir.join(name);
            info!("downloading source {}", url);
            let result = self
                .transport
                .fetch(&url, &dest, self.opts.resume, self.abort_check());
            let exit_st = match result.status {
                FetchStatus::Delivered(_) => codes::OK,
                FetchStatus::NotFound => codes::FETCH_NOT_FOUND,
                FetchStatus::Timeout => codes::FETCH_TIMEOUT,
                FetchStatus::Error => codes::FETCH_IO_ERROR,
                FetchStatus::Cancelled => codes::FETCH_CANCELLED,
            };
            if exit_st != codes::OK {
                return exit_st;
            }
        }
        codes::OK
    }

    fn do_unpack(&mut self) -> i32 {
        let TransactionContext::Install(ctx) = &self.context else {
            return codes::OK;
        };
        info!("unpacking: {}", ctx.base.atom);
        let image_dir = ctx.image_dir.clone();

        for descriptor in self.descriptors() {
            let path = self.settings.fetch_disk_path(&descriptor.download);
            if !path.is_file() {
                // removed in the meantime
                warn!("package file vanished: {}", path.display());
                return codes::VANISHED;
            }
            if let Err(err) = unpack_package(&path, &image_dir) {
                warn!(
                    "unable to unpack package, check if your system is healthy: {}",
                    err
                );
                return codes::FAILED;
            }
        }
        codes::OK
    }

    fn do_remove_conflicts(&mut self) -> i32 {
        let conflict_ids = self.opts.conflict_package_ids.clone();
        for package_id in conflict_ids {
            let opts = ActionOptions {
                remove_config: true,
                ..Default::default()
            };
            let mut sub = match Transaction::prepare(
                ActionKind::RemoveConflict,
                self.installed,
                package_id,
                opts,
                self.settings,
                self.transport,
                self.hooks,
                self.installed,
                self.status,
            ) {
                Ok(sub) => sub,
                Err(err) => {
                    warn!("cannot prepare conflict removal: {}", err);
                    return codes::FAILED;
                }
            };
            // the resource lock is already held by this transaction
            let exit_st = sub.run_steps();
            if exit_st != codes::OK {
                return exit_st;
            }
        }
        codes::OK
    }

    fn do_install(&mut self) -> Result<i32> {
        let TransactionContext::Install(ctx) = &self.context else {
            return Ok(codes::OK);
        };
        let package_id = ctx.base.package_id;
        let image_dir = ctx.image_dir.clone();
        let remove_package_id = ctx.remove_package_id;
        let already_protected = ctx.already_protected.clone();
        info!("installing package: {}", ctx.base.atom);

        let protect = ProtectSets::assemble(
            self.settings,
            &self.repository.config_protect(package_id)?,
            &self.repository.config_protect_mask(package_id)?,
        );
        let mut installer = Installer::new(
            self.settings,
            self.hooks,
            self.installed,
            protect,
            remove_package_id,
            already_protected,
        );
        let exit_st = installer.merge_image(&image_dir)?;
        if exit_st != codes::OK {
            warn!(
                "an error occurred while trying to install the package, check if your system is healthy (code {})",
                exit_st
            );
            return Ok(exit_st);
        }
        let outcome = installer.outcome;

        info!("updating installed packages repository: {}", self.atom());

        // the new package's content ledger, split-debug filtered
        let content = self.repository.content(package_id, false)?;
        let content_file = generate_content_file(
            content.iter().cloned(),
            Some(package_id),
            true,
            self.settings.splitdebug,
            &self.settings.splitdebug_dirs,
            &self.ledger_dir(),
        )?;
        self.temp_files.push(content_file.clone());

        // ledger of the content to clean from the replaced version
        let removecontent_file = match remove_package_id {
            Some(remove_id) => {
                let old_content = self.installed.content(remove_id, true)?;
                let ledger = generate_content_file(
                    old_content.iter().cloned(),
                    Some(remove_id),
                    false,
                    self.settings.splitdebug,
                    &self.settings.splitdebug_dirs,
                    &self.ledger_dir(),
                )?;
                self.temp_files.push(ledger.clone());

                // splice in the paths unique to the new version, keeping
                // the ledger consistent for diff/merge
                let old_paths: HashSet<&String> =
                    old_content.iter().map(|(path, _)| path).collect();
                let mut diff: Vec<(String, EntryType)> = content
                    .iter()
                    .filter(|(path, _)| !old_paths.contains(path))
                    .cloned()
                    .collect();
                diff.sort_by(|a, b| b.0.cmp(&a.0));
                merge_content_file(&ledger, &diff)?;

                // drop everything the merge just placed on disk, resolving
                // aliased directories to one identity
                let items_installed = &outcome.items_installed;
                let settings = self.settings;
                filter_content_file(&ledger, |path| {
                    let identity =
                        Installer::installed_identity(&settings.live_path(path));
                    !items_installed.contains(&identity)
                })?;
                Some(ledger)
            }
            None => None,
        };

        // drop not-installed items (disabled split-debug payloads) from
        // the recorded content
        if !outcome.items_not_installed.is_empty() {
            let items = &outcome.items_not_installed;
            let settings = self.settings;
            filter_content_file(&content_file, |path| {
                !items.contains(&settings.live_path(path).to_string_lossy().into_owned())
            })?;
        }

        // register with the installed packages repository
        let key_slot = self.repository.key_slot(package_id)?.ok_or_else(|| {
            crate::error::Error::NotFoundError(format!("key/slot of package {}", package_id))
        })?;
        let data = PackageData {
            atom: self.atom().to_string(),
            key: key_slot.key,
            slot: key_slot.slot,
            version: self.repository.version(package_id)?,
            download: self.repository.download_url(package_id)?,
            digest: self.repository.digest(package_id)?,
            signatures: self.repository.signatures(package_id)?,
            extra_downloads: self.repository.extra_downloads(package_id)?,
            config_protect: self.repository.config_protect(package_id)?,
            config_protect_mask: self.repository.config_protect_mask(package_id)?,
            original_repository: Some(self.repository.name().to_string()),
        };

        let recorded: Vec<(String, EntryType)> = ContentReader::new(&content_file)
            .iter()?
            .map(|record| record.map(|r| (r.path, r.ftype)))
            .collect::<Result<_>>()?;
        let content_safety = self.repository.content_safety(package_id)?;

        let installed_id = self.installed.add_package(&data, &recorded, &content_safety)?;
        self.installed
            .record_automerge(installed_id, &outcome.automerge_entries)?;

        if let TransactionContext::Install(ctx) = &mut self.context {
            ctx.installed_package_id = Some(installed_id);
            ctx.removecontent_file = removecontent_file;
        }
        Ok(codes::OK)
    }

    fn do_install_clean(&mut self) -> Result<i32> {
        let TransactionContext::Install(ctx) = &self.context else {
            return Ok(codes::OK);
        };
        let Some(ledger) = ctx.removecontent_file.clone() else {
            return Ok(codes::OK);
        };
        info!("cleaning previously installed application data");

        let mut remover = Remover::new(
            self.settings,
            self.hooks,
            self.installed,
            ctx.old_protect.clone(),
            self.opts.remove_config,
            ctx.already_protected.clone(),
        );
        remover.remove_content(&ContentReader::new(&ledger))?;
        Ok(codes::OK)
    }

    fn do_postremove_install(&mut self) -> i32 {
        let TransactionContext::Install(ctx) = &self.context else {
            return codes::OK;
        };
        match ctx.remove_atom.clone() {
            Some(atom) => self.hooks.deregister_installed(&atom),
            None => codes::OK,
        }
    }

    fn do_install_register(&mut self) -> i32 {
        self.hooks.register_installed(self.atom())
    }

    fn do_cleanup(&mut self) -> i32 {
        let TransactionContext::Install(ctx) = &self.context else {
            return codes::OK;
        };
        info!("cleaning: {}", ctx.base.atom);
        // best effort
        if let Err(err) = fs::remove_dir_all(&ctx.unpack_dir) {
            warn!(
                "failed to cleanup directory {}: {}",
                ctx.unpack_dir.display(),
                err
            );
        }
        codes::OK
    }

    fn do_remove(&mut self) -> Result<i32> {
        let TransactionContext::Remove(ctx) = &self.context else {
            return Ok(codes::OK);
        };
        info!("removing package: {}", ctx.base.atom);
        let Some(ledger) = ctx.removecontent_file.clone() else {
            return Ok(codes::OK);
        };

        // drop the repository entry first: an interrupted removal must not
        // leave a registered package with missing files unaccounted for
        self.installed.remove_package(ctx.base.package_id)?;

        let mut remover = Remover::new(
            self.settings,
            self.hooks,
            self.installed,
            ctx.protect.clone(),
            ctx.remove_config,
            ctx.automerge.clone(),
        );
        remover.remove_content(&ContentReader::new(&ledger))?;
        Ok(codes::OK)
    }

    fn do_postremove_remove(&mut self) -> i32 {
        self.hooks.deregister_installed(self.atom())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // remove temporary ledger files
        for path in &self.temp_files {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::SafetyRecord;
    use crate::db::SqliteRepository;
    use crate::hooks::DefaultHooks;
    use crate::settings::RepositoryMirrors;
    use crate::transport::{FileTransport, sha256_bytes};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    fn build_tar_gz(path: &Path, files: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder
            .into_inner()
            .unwrap()
            .finish()
            .unwrap()
            .flush()
            .unwrap();
    }

    struct World {
        settings: ClientSettings,
        transport: FileTransport,
        repo: SqliteRepository,
        installed: SqliteRepository,
        status: MirrorStatus,
        root: PathBuf,
        mirror: PathBuf,
    }

    impl World {
        fn new(dir: &Path) -> Self {
            let root = dir.join("root");
            let mirror = dir.join("mirror");
            fs::create_dir_all(&root).unwrap();
            fs::create_dir_all(&mirror).unwrap();

            let mut settings = ClientSettings::default();
            settings.system_root = root.clone();
            settings.packages_dir = dir.join("store");
            settings.unpack_dir = dir.join("scratch");
            settings.lock_path = dir.join("resources.lock");
            settings.available.insert(
                "main".to_string(),
                RepositoryMirrors {
                    mirrors: vec![format!("file://{}", mirror.display())],
                },
            );

            Self {
                settings,
                transport: FileTransport::new(),
                repo: SqliteRepository::in_memory("main").unwrap(),
                installed: SqliteRepository::in_memory("__system__").unwrap(),
                status: MirrorStatus::new(),
                root,
                mirror,
            }
        }

        fn publish(&self, atom: &str, version: &str, files: &[(&str, &[u8])]) -> PackageId {
            let download = format!("{}-{}.tar.gz", atom.rsplit('/').next().unwrap(), version);
            let archive = self.mirror.join(&download);
            build_tar_gz(&archive, files);
            let digest = crate::verify::sha256_file(&archive).unwrap();

            let mut content: Vec<(String, EntryType)> = Vec::new();
            let mut dirs: HashSet<String> = HashSet::new();
            for (name, _) in files {
                let path = format!("/{}", name);
                content.push((path.clone(), EntryType::Obj));
                let mut cursor = Path::new(&path).parent();
                while let Some(dir) = cursor {
                    if dir != Path::new("/") {
                        dirs.insert(dir.to_string_lossy().into_owned());
                    }
                    cursor = dir.parent();
                }
            }
            content.extend(dirs.into_iter().map(|d| (d, EntryType::Dir)));

            let data = PackageData {
                atom: format!("{}-{}", atom, version),
                key: atom.to_string(),
                slot: "0".to_string(),
                version: version.to_string(),
                download,
                digest,
                ..Default::default()
            };
            self.repo.register(&data, &content, &[]).unwrap()
        }

        fn factory(&self) -> TransactionFactory<'_> {
            TransactionFactory {
                settings: &self.settings,
                transport: &self.transport,
                hooks: &DefaultHooks,
                installed: &self.installed,
                status: &self.status,
            }
        }
    }

    #[test]
    fn test_fetch_action_downloads_and_verifies() {
        let dir = tempdir().unwrap();
        let world = World::new(dir.path());
        let package_id = world.publish("app-misc/hello", "1.0", &[("usr/bin/hello", b"hi\n")]);

        let mut tx = world
            .factory()
            .prepare(ActionKind::Fetch, &world.repo, package_id, Default::default())
            .unwrap();
        assert_eq!(tx.steps(), &[Step::Fetch, Step::Checksum]);
        assert_eq!(tx.run(), codes::OK);

        let stored = world.settings.fetch_disk_path("hello-1.0.tar.gz");
        assert!(stored.is_file());
    }

    #[test]
    fn test_fetch_not_available_is_an_informational_noop() {
        let dir = tempdir().unwrap();
        let world = World::new(dir.path());
        let data = PackageData {
            atom: "app-misc/ghost-1.0".to_string(),
            key: "app-misc/ghost".to_string(),
            slot: "0".to_string(),
            version: "1.0".to_string(),
            download: String::new(),
            digest: "00".to_string(),
            ..Default::default()
        };
        let package_id = world.repo.register(&data, &[], &[]).unwrap();

        let mut tx = world
            .factory()
            .prepare(ActionKind::Fetch, &world.repo, package_id, Default::default())
            .unwrap();
        assert!(tx.steps().is_empty());
        assert_eq!(tx.run(), codes::OK);
    }

    #[test]
    fn test_install_action_end_to_end() {
        let dir = tempdir().unwrap();
        let world = World::new(dir.path());
        let package_id = world.publish(
            "app-misc/hello",
            "1.0",
            &[
                ("usr/bin/hello", b"#!/bin/sh\necho hi\n"),
                ("etc/hello.conf", b"greeting = hi\n"),
            ],
        );

        let mut tx = world
            .factory()
            .prepare(ActionKind::Install, &world.repo, package_id, Default::default())
            .unwrap();
        assert_eq!(tx.run(), codes::OK);

        // files landed on the live root
        assert!(world.root.join("usr/bin/hello").is_file());
        assert!(world.root.join("etc/hello.conf").is_file());

        // the installed repository knows the package and its content
        let installed_id = tx.installed_package_id().unwrap();
        assert!(world.installed.is_package_available(installed_id).unwrap());
        assert!(
            world
                .installed
                .file_owners("/usr/bin/hello")
                .unwrap()
                .contains(&installed_id)
        );
        // the fresh config file got an automerge digest recorded
        let automerge = world.installed.automerge_map(installed_id).unwrap();
        assert!(automerge.contains_key("/etc/hello.conf"));
    }

    #[test]
    fn test_upgrade_removes_dropped_files_and_respects_config_protection() {
        let dir = tempdir().unwrap();
        let world = World::new(dir.path());

        let v1 = world.publish(
            "app-misc/hello",
            "1.0",
            &[
                ("usr/bin/hello", b"v1\n"),
                ("usr/share/hello/obsolete", b"old\n"),
                ("etc/hello.conf", b"greeting = v1\n"),
            ],
        );
        let mut tx = world
            .factory()
            .prepare(ActionKind::Install, &world.repo, v1, Default::default())
            .unwrap();
        assert_eq!(tx.run(), codes::OK);
        drop(tx);

        // the user edits the config file
        fs::write(world.root.join("etc/hello.conf"), b"greeting = custom\n").unwrap();

        let v2 = world.publish(
            "app-misc/hello",
            "2.0",
            &[
                ("usr/bin/hello", b"v2\n"),
                ("etc/hello.conf", b"greeting = v2\n"),
            ],
        );
        let mut tx = world
            .factory()
            .prepare(ActionKind::Install, &world.repo, v2, Default::default())
            .unwrap();
        assert_eq!(tx.run(), codes::OK);

        // upgraded binary, obsolete file cleaned up
        assert_eq!(
            fs::read(world.root.join("usr/bin/hello")).unwrap(),
            b"v2\n"
        );
        assert!(!world.root.join("usr/share/hello/obsolete").exists());

        // the edited config file was protected, the update went to a sibling
        assert_eq!(
            fs::read(world.root.join("etc/hello.conf")).unwrap(),
            b"greeting = custom\n"
        );
        assert_eq!(
            fs::read(world.root.join("etc/._cfg0000_hello.conf")).unwrap(),
            b"greeting = v2\n"
        );
    }

    #[test]
    fn test_remove_action_deletes_content_and_entry() {
        let dir = tempdir().unwrap();
        let world = World::new(dir.path());
        let package_id = world.publish(
            "app-misc/hello",
            "1.0",
            &[("usr/share/doc/hello/README", b"docs\n")],
        );

        let mut tx = world
            .factory()
            .prepare(ActionKind::Install, &world.repo, package_id, Default::default())
            .unwrap();
        assert_eq!(tx.run(), codes::OK);
        let installed_id = tx.installed_package_id().unwrap();
        drop(tx);

        let mut tx = world
            .factory()
            .prepare(
                ActionKind::Remove,
                &world.installed,
                installed_id,
                Default::default(),
            )
            .unwrap();
        assert_eq!(
            tx.steps(),
            &[
                Step::Preremove,
                Step::Remove,
                Step::Postremove,
                Step::PostremoveRemove
            ]
        );
        assert_eq!(tx.run(), codes::OK);

        assert!(!world.root.join("usr/share/doc/hello").exists());
        assert!(!world.installed.is_package_available(installed_id).unwrap());
    }

    #[test]
    fn test_remove_vanished_target_short_circuits() {
        let dir = tempdir().unwrap();
        let world = World::new(dir.path());

        let mut tx = world
            .factory()
            .prepare(ActionKind::Remove, &world.installed, 9999, Default::default())
            .unwrap();
        assert!(tx.steps().is_empty());
        assert_eq!(tx.run(), codes::OK);
    }

    #[test]
    fn test_config_action_runs_configure_phase() {
        let dir = tempdir().unwrap();
        let world = World::new(dir.path());
        let data = PackageData {
            atom: "app-misc/hello-1.0".to_string(),
            key: "app-misc/hello".to_string(),
            slot: "0".to_string(),
            version: "1.0".to_string(),
            download: "hello-1.0.tar.gz".to_string(),
            digest: "00".to_string(),
            ..Default::default()
        };
        let installed_id = world.installed.register(&data, &[], &[]).unwrap();

        let mut tx = world
            .factory()
            .prepare(
                ActionKind::Config,
                &world.installed,
                installed_id,
                Default::default(),
            )
            .unwrap();
        assert_eq!(tx.steps(), &[Step::Config]);
        assert_eq!(tx.run(), codes::OK);
    }

    #[test]
    fn test_safety_records_survive_registration() {
        let dir = tempdir().unwrap();
        let world = World::new(dir.path());
        let package_id = world.publish("app-misc/hello", "1.0", &[("etc/hello.conf", b"x\n")]);

        // attach a content-safety snapshot to the repository entry
        let safety = vec![SafetyRecord {
            path: "/etc/hello.conf".to_string(),
            sha256: sha256_bytes(b"x\n"),
            mtime: 1700000000.0,
        }];
        let data = PackageData {
            atom: "app-misc/hello-1.0".to_string(),
            key: "app-misc/hello".to_string(),
            slot: "0".to_string(),
            version: "1.0".to_string(),
            download: world.repo.download_url(package_id).unwrap(),
            digest: world.repo.digest(package_id).unwrap(),
            ..Default::default()
        };
        let package_id = world
            .repo
            .register(
                &data,
                &[("/etc/hello.conf".to_string(), EntryType::Obj)],
                &safety,
            )
            .unwrap();

        let mut tx = world
            .factory()
            .prepare(ActionKind::Install, &world.repo, package_id, Default::default())
            .unwrap();
        assert_eq!(tx.run(), codes::OK);

        let installed_id = tx.installed_package_id().unwrap();
        let recorded = world.installed.content_safety(installed_id).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].path, "/etc/hello.conf");
    }
}
