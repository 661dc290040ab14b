//! The version solver: backtracking search with conflict-driven reordering.
//!
//! Given the root pubspec, the source registry (reached through the system
//! cache handle), and the previous lockfile, the solver picks a concrete
//! [`PackageId`] for every transitively-required package such that all
//! version constraints hold simultaneously.
//!
//! # Search shape
//!
//! The state is a partial assignment: one *dependency cell* per package
//! name, holding the unified [`PackageRef`], the intersection of every
//! incoming constraint, and the chosen id once decided. Only the root is
//! assigned initially. Each step picks an undecided cell (failing sets
//! first, then forced single-candidate cells, then the cell most recently
//! involved in a conflict, then fewest candidates, ties broken by name),
//! snapshots the assignment, and tries candidates newest-first, except
//! that a still-valid locked version is tried before anything newer, which
//! is what keeps an unchanged project on its locked graph.
//!
//! Applying a candidate fetches its pubspec and intersects each declared
//! dependency into the target cell. An empty intersection, a disagreement
//! with an already-chosen id, a source/description mismatch, or an
//! unsatisfiable SDK constraint is a *conflict* naming every package
//! involved. The failing candidate is excluded and the next one tried; when
//! a cell runs dry, the search unwinds to the deepest decision that
//! participated in its conflicts; decisions in between are discarded
//! wholesale, while shallower cells keep their state.
//!
//! The solver is deterministic for fixed inputs and registry state: cells
//! live in ordered maps and every tie-break ends at the package name.
//!
//! Fetch failures other than the three recoverable conflict kinds
//! (no-version, source-mismatch, SDK-mismatch) abort the solve unchanged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;

use crate::cache::SystemCache;
use crate::core::TavernError;
use crate::lockfile::LockFile;
use crate::manifest::{Dependency, Pubspec};
use crate::package::{Package, PackageId, PackageRef};
use crate::version::{Version, VersionConstraint};

pub mod report;

pub use report::{ChangeKind, SolveReport};

/// Knobs for one solve.
#[derive(Debug, Clone, Default)]
pub struct SolveOptions {
    /// Packages forced to their latest satisfying version even when locked.
    pub use_latest: HashSet<String>,
    /// Ignore the lockfile entirely and take the newest satisfying version
    /// of everything.
    pub upgrade_all: bool,
}

/// A successful resolution.
#[derive(Debug, Clone)]
pub struct SolveResult {
    /// One id per package of the solved graph, root included, ordered by
    /// name.
    pub packages: Vec<PackageId>,
    /// How many candidate assignments were abandoned on the way here.
    pub attempted_solutions: u64,
}

impl SolveResult {
    /// The solved ids without the root.
    pub fn non_root_packages(&self) -> impl Iterator<Item = &PackageId> {
        self.packages.iter().filter(|id| !id.is_root())
    }
}

/// Solve the dependency graph rooted at `root`.
///
/// # Errors
///
/// [`TavernError::NoVersionAvailable`], [`TavernError::SourceMismatch`], or
/// [`TavernError::SdkConstraintMismatch`] when the constraint space is
/// unsatisfiable; any other error is a fetch or parse failure surfaced
/// unchanged from the sources consulted.
pub async fn solve(
    cache: &Arc<SystemCache>,
    root: &Package,
    lockfile: &LockFile,
    options: &SolveOptions,
) -> Result<SolveResult> {
    Solver::new(cache, root, lockfile, options).run().await
}

/// One package's slot in the partial assignment.
#[derive(Debug, Clone)]
struct Cell {
    /// Unified ref every depender agreed on.
    package_ref: PackageRef,
    /// Intersection of all incoming constraints.
    constraint: VersionConstraint,
    /// Who constrained this cell, and to what. Drives error chains.
    dependers: Vec<(String, VersionConstraint)>,
    /// The decision, once made.
    selected: Option<PackageId>,
}

type Assignment = BTreeMap<String, Cell>;

/// One decision on the backtracking stack.
struct Frame {
    /// Package decided at this level.
    name: String,
    /// Candidates not yet tried, best-first.
    candidates: Vec<Version>,
    /// The assignment as it stood before this decision.
    snapshot: Assignment,
    /// Every package that participated in a conflict while this decision
    /// was on trial. Attribution target set for backjumping.
    conflicts: HashSet<String>,
}

/// Outcome of applying one candidate.
enum Applied {
    Ok,
    Conflict {
        involved: HashSet<String>,
        error: anyhow::Error,
    },
}

struct Solver<'a> {
    cache: &'a Arc<SystemCache>,
    root: &'a Package,
    lockfile: &'a LockFile,
    options: &'a SolveOptions,
    versions: HashMap<PackageRef, Vec<Version>>,
    pubspecs: HashMap<PackageId, Pubspec>,
    last_conflict: HashMap<String, u64>,
    conflict_seq: u64,
    attempted: u64,
}

impl<'a> Solver<'a> {
    fn new(
        cache: &'a Arc<SystemCache>,
        root: &'a Package,
        lockfile: &'a LockFile,
        options: &'a SolveOptions,
    ) -> Self {
        Self {
            cache,
            root,
            lockfile,
            options,
            versions: HashMap::new(),
            pubspecs: HashMap::new(),
            last_conflict: HashMap::new(),
            conflict_seq: 0,
            attempted: 1,
        }
    }

    async fn run(mut self) -> Result<SolveResult> {
        self.check_root_sdk()?;

        let mut assignment = Assignment::new();
        assignment.insert(
            self.root.id.name.clone(),
            Cell {
                package_ref: self.root.id.as_ref(),
                constraint: VersionConstraint::exact(self.root.id.version.clone()),
                dependers: Vec::new(),
                selected: Some(self.root.id.clone()),
            },
        );

        // The root's own deps, dev deps included, apply only at the root.
        let root_name = self.root.id.name.clone();
        let root_deps: Vec<Dependency> = self
            .root
            .pubspec
            .dependencies
            .iter()
            .chain(&self.root.pubspec.dev_dependencies)
            .cloned()
            .collect();
        if let Applied::Conflict {
            error, ..
        } = self.apply_dependencies(&mut assignment, &root_name, &root_deps)?
        {
            return Err(error);
        }

        let mut stack: Vec<Frame> = Vec::new();
        let mut last_failure: Option<anyhow::Error> = None;

        'search: loop {
            let Some(name) = self.pick_cell(&assignment).await? else {
                // Every reachable cell is decided; BTreeMap order keeps the
                // result sorted by name.
                let packages: Vec<PackageId> = assignment
                    .into_values()
                    .filter_map(|cell| cell.selected)
                    .collect();
                tracing::debug!(
                    target: "solver",
                    attempts = self.attempted,
                    "version solving succeeded"
                );
                return Ok(SolveResult {
                    packages,
                    attempted_solutions: self.attempted,
                });
            };

            let cell = assignment.get(&name).expect("picked cell exists").clone();
            let candidates = self.ordered_candidates(&cell).await?;

            if candidates.is_empty() {
                let involved = self.involved_names(&name, &cell);
                let error = self.no_version_error(&assignment, &name, &cell);
                self.note_conflict(&involved);
                last_failure = Some(error);
                if let Some(frame) = self.backjump(&mut stack, &mut assignment, &involved)
                    && self
                        .retry_frame(&mut stack, &mut assignment, frame, &mut last_failure)
                        .await?
                {
                    continue 'search;
                }
                return Err(last_failure.expect("a recorded failure"));
            }

            let frame = Frame {
                name: name.clone(),
                candidates,
                snapshot: assignment.clone(),
                conflicts: HashSet::new(),
            };
            if self.retry_frame(&mut stack, &mut assignment, frame, &mut last_failure).await? {
                continue 'search;
            }
            return Err(last_failure.unwrap_or_else(|| {
                TavernError::Internal {
                    message: "solver exhausted the search space without recording a failure".into(),
                }
                .into()
            }));
        }
    }

    /// Drive `frame` (and, when it runs dry, whichever shallower frame the
    /// conflict attribution lands on) until a candidate sticks. `true`
    /// means the assignment advanced; `false` means the whole search space
    /// is exhausted.
    async fn retry_frame(
        &mut self,
        stack: &mut Vec<Frame>,
        assignment: &mut Assignment,
        frame: Frame,
        last_failure: &mut Option<anyhow::Error>,
    ) -> Result<bool> {
        let mut frame = frame;
        loop {
            let Some(version) = frame.candidates.first().cloned() else {
                // Exhausted: attribute to the deepest decision that took
                // part in any conflict seen here, or failing that to
                // whoever constrained this cell.
                let mut involved = std::mem::take(&mut frame.conflicts);
                let cell = frame
                    .snapshot
                    .get(&frame.name)
                    .cloned();
                if let Some(cell) = &cell {
                    involved.extend(self.involved_names(&frame.name, cell));
                    if last_failure.is_none() {
                        *last_failure =
                            Some(self.no_version_error(&frame.snapshot, &frame.name, cell));
                    }
                }
                self.note_conflict(&involved);
                *assignment = frame.snapshot;
                match self.backjump(stack, assignment, &involved) {
                    Some(parent) => {
                        frame = parent;
                        self.attempted += 1;
                        continue;
                    }
                    None => return Ok(false),
                }
            };
            frame.candidates.remove(0);

            *assignment = frame.snapshot.clone();
            let id = {
                let cell = assignment.get(&frame.name).expect("cell in snapshot");
                cell.package_ref.at_version(version)
            };

            match self.apply_decision(assignment, &id).await? {
                Applied::Ok => {
                    stack.push(frame);
                    return Ok(true);
                }
                Applied::Conflict {
                    involved,
                    error,
                } => {
                    tracing::debug!(
                        target: "solver",
                        package = %id,
                        conflict = %error,
                        "candidate rejected"
                    );
                    self.attempted += 1;
                    self.note_conflict(&involved);
                    frame.conflicts.extend(involved);
                    *last_failure = Some(error);
                }
            }
        }
    }

    /// Pop decisions until the top of the stack is one of `involved`,
    /// undoing their effects. Returns the frame to retry, or `None` when
    /// the stack ran out (search space exhausted).
    fn backjump(
        &mut self,
        stack: &mut Vec<Frame>,
        assignment: &mut Assignment,
        involved: &HashSet<String>,
    ) -> Option<Frame> {
        while let Some(frame) = stack.pop() {
            *assignment = frame.snapshot.clone();
            if involved.contains(&frame.name) {
                let mut frame = frame;
                frame.conflicts.extend(involved.iter().cloned());
                return Some(frame);
            }
            // Not implicated: this decision is discarded outright; its
            // candidates would only reproduce the same conflict.
            self.attempted += 1;
        }
        None
    }

    /// Choose the next undecided cell, or `None` when the assignment is
    /// complete.
    async fn pick_cell(&mut self, assignment: &Assignment) -> Result<Option<String>> {
        let undecided: Vec<String> = assignment
            .iter()
            .filter(|(_, cell)| cell.selected.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        if undecided.is_empty() {
            return Ok(None);
        }

        let mut counted: Vec<(String, usize)> = Vec::with_capacity(undecided.len());
        for name in undecided {
            let cell = assignment.get(&name).expect("undecided cell").clone();
            let count = self.ordered_candidates(&cell).await?.len();
            // Empty sets fail fast, forced moves go next; both beat any
            // heuristic pick. The iteration order is by name, so the first
            // hit is the deterministic one.
            if count == 0 || count == 1 {
                return Ok(Some(name));
            }
            counted.push((name, count));
        }

        counted.sort_by(|(a_name, a_count), (b_name, b_count)| {
            let a_conflict = self.last_conflict.get(a_name).copied().unwrap_or(0);
            let b_conflict = self.last_conflict.get(b_name).copied().unwrap_or(0);
            b_conflict
                .cmp(&a_conflict)
                .then_with(|| a_count.cmp(b_count))
                .then_with(|| a_name.cmp(b_name))
        });
        Ok(counted.into_iter().next().map(|(name, _)| name))
    }

    /// The cell's allowed versions in trial order: newest first, with a
    /// still-satisfying locked version promoted to the front unless the
    /// caller asked for latest.
    async fn ordered_candidates(&mut self, cell: &Cell) -> Result<Vec<Version>> {
        let all = self.versions_for(&cell.package_ref).await?;
        let mut allowed: Vec<Version> =
            all.into_iter().filter(|v| cell.constraint.allows(v)).collect();
        allowed.sort_by(|a, b| b.cmp(a));
        allowed.dedup();

        let name = &cell.package_ref.name;
        let honor_lock = !self.options.upgrade_all && !self.options.use_latest.contains(name);
        if honor_lock
            && let Some(locked) = self.lockfile.package(name)
            && let Some(position) = allowed.iter().position(|v| *v == locked.version)
        {
            let locked_version = allowed.remove(position);
            allowed.insert(0, locked_version);
        }
        Ok(allowed)
    }

    /// Commit `id` into its cell and fold its dependencies into the
    /// assignment.
    async fn apply_decision(&mut self, assignment: &mut Assignment, id: &PackageId) -> Result<Applied> {
        let pubspec = self.pubspec_for(id).await?;

        if let Some(sdk) = &pubspec.sdk_constraint {
            let active = &self.cache.session().sdk_version;
            if !sdk.allows(active) {
                return Ok(Applied::Conflict {
                    involved: HashSet::from([id.name.clone()]),
                    error: TavernError::SdkConstraintMismatch {
                        package: format!("{} {}", id.name, id.version),
                        constraint: sdk.to_string(),
                        active: active.to_string(),
                    }
                    .into(),
                });
            }
        }

        if let Some(cell) = assignment.get_mut(&id.name) {
            cell.selected = Some(id.clone());
        }

        let deps = pubspec.dependencies.clone();
        self.apply_dependencies(assignment, &id.name, &deps)
    }

    /// Intersect `deps` (declared by `depender`) into their cells.
    fn apply_dependencies(
        &mut self,
        assignment: &mut Assignment,
        depender: &str,
        deps: &[Dependency],
    ) -> Result<Applied> {
        for dep in deps {
            let name = dep.name().to_string();

            // A dependency back onto the root: satisfiable only if the
            // root's own version fits. The root is never re-decided.
            if name == self.root.id.name {
                if !dep.constraint.allows(&self.root.id.version) {
                    return Ok(Applied::Conflict {
                        involved: HashSet::from([name.clone(), depender.to_string()]),
                        error: TavernError::NoVersionAvailable {
                            package: name.clone(),
                            constraint: dep.constraint.to_string(),
                            chain: format!(
                                "  - {depender} depends on {name} {} but {name} is {}",
                                dep.constraint, self.root.id.version
                            ),
                        }
                        .into(),
                    });
                }
                continue;
            }

            let Some(existing) = assignment.get(&name).cloned() else {
                assignment.insert(
                    name,
                    Cell {
                        package_ref: dep.target.clone(),
                        constraint: dep.constraint.clone(),
                        dependers: vec![(depender.to_string(), dep.constraint.clone())],
                        selected: None,
                    },
                );
                continue;
            };

            // Same name from a different source or description is never
            // reconcilable by version arithmetic.
            let unified = existing.package_ref.source == dep.target.source
                && self
                    .cache
                    .sources()
                    .get(&dep.target.source)
                    .map(|source| {
                        source.descriptions_equal(
                            &existing.package_ref.description,
                            &dep.target.description,
                        )
                    })
                    .unwrap_or(false);
            if !unified {
                let mut involved = self.involved_names(&name, &existing);
                involved.insert(depender.to_string());
                return Ok(Applied::Conflict {
                    involved,
                    error: TavernError::SourceMismatch {
                        package: name.clone(),
                        first: describe_requirement(&existing),
                        second: format!("{} from {}", dep.target.name, dep.target.source),
                    }
                    .into(),
                });
            }

            let narrowed = existing.constraint.intersect(&dep.constraint);
            let still_selected = match &existing.selected {
                Some(id) => narrowed.allows(&id.version),
                None => true,
            };
            if narrowed.is_empty() || !still_selected {
                let mut cell_view = existing.clone();
                cell_view.dependers.push((depender.to_string(), dep.constraint.clone()));
                cell_view.constraint = narrowed;
                let mut involved = self.involved_names(&name, &cell_view);
                involved.insert(depender.to_string());
                let error = self.no_version_error(assignment, &name, &cell_view);
                return Ok(Applied::Conflict {
                    involved,
                    error,
                });
            }

            let cell = assignment.get_mut(&name).expect("cell just read");
            cell.constraint = narrowed;
            cell.dependers.push((depender.to_string(), dep.constraint.clone()));
        }
        Ok(Applied::Ok)
    }

    fn check_root_sdk(&self) -> Result<()> {
        if let Some(sdk) = &self.root.pubspec.sdk_constraint {
            let active = &self.cache.session().sdk_version;
            if !sdk.allows(active) {
                return Err(TavernError::SdkConstraintMismatch {
                    package: self.root.id.name.clone(),
                    constraint: sdk.to_string(),
                    active: active.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    async fn versions_for(&mut self, package_ref: &PackageRef) -> Result<Vec<Version>> {
        if let Some(versions) = self.versions.get(package_ref) {
            return Ok(versions.clone());
        }
        let source = self.cache.sources().get(&package_ref.source)?;
        let versions = source.get_versions(package_ref, self.cache).await?;
        self.versions.insert(package_ref.clone(), versions.clone());
        Ok(versions)
    }

    async fn pubspec_for(&mut self, id: &PackageId) -> Result<Pubspec> {
        if let Some(pubspec) = self.pubspecs.get(id) {
            return Ok(pubspec.clone());
        }
        let source = self.cache.sources().get(&id.source)?;
        let pubspec = source.describe_uncached(id, self.cache).await?;
        if pubspec.name != id.name {
            return Err(TavernError::ParseError {
                subject: format!("pubspec of {id}"),
                reason: format!("names itself \"{}\" instead of \"{}\"", pubspec.name, id.name),
            }
            .into());
        }
        self.pubspecs.insert(id.clone(), pubspec.clone());
        Ok(pubspec)
    }

    fn note_conflict(&mut self, involved: &HashSet<String>) {
        self.conflict_seq += 1;
        for name in involved {
            self.last_conflict.insert(name.clone(), self.conflict_seq);
        }
    }

    fn involved_names(&self, name: &str, cell: &Cell) -> HashSet<String> {
        let mut involved: HashSet<String> =
            cell.dependers.iter().map(|(depender, _)| depender.clone()).collect();
        involved.insert(name.to_string());
        involved.remove(&self.root.id.name);
        involved
    }

    fn no_version_error(
        &self,
        assignment: &Assignment,
        name: &str,
        cell: &Cell,
    ) -> anyhow::Error {
        let mut chain = String::new();
        for (depender, constraint) in &cell.dependers {
            let version = assignment
                .get(depender)
                .and_then(|cell| cell.selected.as_ref())
                .map(|id| format!(" {}", id.version))
                .unwrap_or_default();
            chain.push_str(&format!("  - {depender}{version} depends on {name} {constraint}\n"));
        }
        TavernError::NoVersionAvailable {
            package: name.to_string(),
            constraint: cell.constraint.to_string(),
            chain: chain.trim_end().to_string(),
        }
        .into()
    }
}

fn describe_requirement(cell: &Cell) -> String {
    format!("{} from {}", cell.package_ref.name, cell.package_ref.source)
}
