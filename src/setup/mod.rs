//! Distributed composite-grid setup.
//!
//! [`comp_grid_setup`] seeds one [`CompGrid`] per level from the hierarchy,
//! discovers on every level which ranks need which owned nodes, and then walks
//! the levels from coarsest to finest. On each level every rank packs, for each
//! neighbor, the nodes within reach on that level and every coarser one,
//! exchanges the buffers, merges what it receives, and finally tells each
//! sender which of its nodes were kept.

pub mod distance_search;
pub mod neighbors;
pub mod pack;
pub mod unpack;
pub mod verify;

pub use distance_search::RequestList;
pub use neighbors::setup_nearest_processor_neighbors;
pub use pack::{PackedBuffer, pack_send_buffer};
pub use unpack::{UnpackOutcome, pack_recv_map_send_buffer, unpack_recv_buffer, unpack_send_flag_buffer};

use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::exchange::{exchange_counts, exchange_words};
use crate::algs::wire::WireWord;
use crate::comp_grid::{CompGrid, CompGridCommPkg, LevelCommPkg, finalize_grids, resolve_local_indices};
use crate::compgrid_error::CompGridError;
use crate::debug_invariants::DebugInvariants;
use crate::hierarchy::AmgHierarchy;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Discovery rounds: `+0` request sizes, `+1` request payloads.
pub(crate) const TAG_DISCOVERY: CommTag = CommTag::new(0x4100);
/// Cross-rank symmetry check (broadcast uses `+0` and `+1`).
pub(crate) const TAG_SYMMETRY: CommTag = CommTag::new(0x4110);
/// Assembly: `+0` buffer sizes, `+1` buffers.
pub(crate) const TAG_BUFFER: CommTag = CommTag::new(0x4200);
/// Send-map correction.
pub(crate) const TAG_SEND_MAP: CommTag = CommTag::new(0x4300);
/// Verification broadcasts (`+0` and `+1`).
pub(crate) const TAG_VERIFY: CommTag = CommTag::new(0x4400);

/// Knobs of the composite-grid setup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupParams {
    /// Graph distance from owned nodes that must be present as real nodes.
    pub padding: usize,
    /// Extra layers kept as ghosts beyond the padding.
    pub num_ghost_layers: usize,
    /// Synchronize all ranks between phases (for timing).
    pub use_barriers: bool,
    /// Symmetry checks, post-merge invariant checks and the verification tests.
    pub debug_checks: bool,
    pub collect_timers: bool,
}

impl Default for SetupParams {
    fn default() -> Self {
        Self {
            padding: 1,
            num_ghost_layers: 1,
            use_barriers: false,
            debug_checks: false,
            collect_timers: false,
        }
    }
}

impl SetupParams {
    pub fn validate(&self) -> Result<(), CompGridError> {
        if self.padding == 0 && self.num_ghost_layers == 0 {
            return Err(CompGridError::InvalidParams(
                "padding and num_ghost_layers are both zero".into(),
            ));
        }
        Ok(())
    }
}

/// Non-fatal outcome of a setup run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetupStatus {
    /// Columns the psi-composite expansion could not follow while packing.
    pub psi_composite_errors: usize,
    /// Set when any verification test failed (only with `debug_checks`).
    pub verification_failed: bool,
}

/// Timed phases of the setup.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetupPhase {
    NeighborDiscovery,
    Pack,
    SizeExchange,
    BufferExchange,
    Unpack,
    LocalIndices,
    SendMapCorrection,
}

impl SetupPhase {
    pub const ALL: [SetupPhase; 7] = [
        SetupPhase::NeighborDiscovery,
        SetupPhase::Pack,
        SetupPhase::SizeExchange,
        SetupPhase::BufferExchange,
        SetupPhase::Unpack,
        SetupPhase::LocalIndices,
        SetupPhase::SendMapCorrection,
    ];
}

/// Accumulated wall time per [`SetupPhase`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetupTimers {
    durations: [Duration; 7],
}

impl SetupTimers {
    pub fn get(&self, phase: SetupPhase) -> Duration {
        self.durations[phase as usize]
    }

    pub fn total(&self) -> Duration {
        self.durations.iter().sum()
    }

    fn time<T>(&mut self, enabled: bool, phase: SetupPhase, f: impl FnOnce() -> T) -> T {
        let start = enabled.then(Instant::now);
        let out = f();
        if let Some(start) = start {
            self.durations[phase as usize] += start.elapsed();
        }
        out
    }
}

/// Everything the setup produces on one rank.
#[derive(Clone, Debug)]
pub struct SetupOutput {
    pub grids: Vec<CompGrid>,
    pub comm_pkg: CompGridCommPkg,
    pub timers: SetupTimers,
    pub status: SetupStatus,
}

/// Build the composite grids of every level. Collective over `comm`.
///
/// Transport and wire failures abort with `Err`; unresolved columns met while
/// packing are counted in [`SetupStatus::psi_composite_errors`] and the setup
/// continues.
pub fn comp_grid_setup<C>(
    hierarchy: &AmgHierarchy,
    params: &SetupParams,
    comm: &C,
) -> Result<SetupOutput, CompGridError>
where
    C: Communicator,
{
    params.validate()?;
    hierarchy.validate()?;
    let num_levels = hierarchy.num_levels();
    let mut grids = hierarchy
        .levels
        .iter()
        .enumerate()
        .map(|(l, lv)| CompGrid::from_level(l, lv))
        .collect::<Result<Vec<_>, _>>()?;
    let mut pkg = CompGridCommPkg::new(num_levels);
    let mut timers = SetupTimers::default();
    let mut status = SetupStatus::default();

    timers.time(params.collect_timers, SetupPhase::NeighborDiscovery, || {
        for (level, grid) in grids.iter().enumerate() {
            setup_nearest_processor_neighbors(&hierarchy.levels[level].a, grid, &mut pkg, level, params, comm)?;
        }
        Ok::<_, CompGridError>(())
    })?;
    comm.barrier();

    for level in (0..num_levels).rev() {
        if grids[level].num_owned_nodes() > 0 && pkg.level(level).num_sends() > 0 {
            status.psi_composite_errors += setup_level(&mut grids, &mut pkg, level, params, comm, &mut timers)?;
        } else if params.use_barriers {
            // keep the phase barriers of ranks that do work on this level matched
            for _ in 0..6 {
                comm.barrier();
            }
        }
    }
    if status.psi_composite_errors > 0 {
        log::warn!(
            "rank {}: {} unresolved column(s) while building psi-composite grids",
            comm.rank(),
            status.psi_composite_errors
        );
    }

    // ranks that skipped levels still hold links to nodes merged later
    resolve_local_indices(&mut grids);
    let shape_failed =
        params.debug_checks && verify::test_comp_grids_1(&grids, params.padding, params.num_ghost_layers);

    finalize_grids(&mut grids);

    if params.debug_checks {
        let restrict_failed = verify::test_comp_grids_2(&grids);
        let content_failed = verify::test_comp_grids_3(&grids, hierarchy, comm)?;
        status.verification_failed = shape_failed || restrict_failed || content_failed;
        if status.verification_failed {
            log::warn!(
                "rank {}: composite grid verification failed (shape {shape_failed}, restriction {restrict_failed}, content {content_failed})",
                comm.rank()
            );
        }
    }

    Ok(SetupOutput {
        grids,
        comm_pkg: pkg,
        timers,
        status,
    })
}

/// Pack every neighbor's buffer for `level`; in parallel with the `rayon` feature.
fn pack_all(
    grids: &[CompGrid],
    pkg: &LevelCommPkg,
    level: usize,
    params: &SetupParams,
) -> Result<Vec<PackedBuffer>, CompGridError> {
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        (0..pkg.num_sends())
            .into_par_iter()
            .map(|i| pack_send_buffer(grids, pkg, i, level, params))
            .collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        (0..pkg.num_sends())
            .map(|i| pack_send_buffer(grids, pkg, i, level, params))
            .collect()
    }
}

/// One assembly round on `level`. Returns the psi-composite error count.
fn setup_level<C>(
    grids: &mut [CompGrid],
    pkg: &mut CompGridCommPkg,
    level: usize,
    params: &SetupParams,
    comm: &C,
    timers: &mut SetupTimers,
) -> Result<usize, CompGridError>
where
    C: Communicator,
{
    let num_levels = grids.len();
    let timed = params.collect_timers;
    let barrier = || {
        if params.use_barriers {
            comm.barrier();
        }
    };

    barrier();
    let mut packed = timers.time(timed, SetupPhase::Pack, || pack_all(grids, pkg.level(level), level, params))?;
    let errors = packed.iter().map(|b| b.psi_composite_errors).sum();

    barrier();
    let send_procs = pkg.level(level).send_procs.clone();
    let recv_procs = pkg.level(level).recv_procs.clone();
    let outgoing: Vec<(usize, usize)> = send_procs
        .iter()
        .zip(&packed)
        .map(|(&p, b)| (p, b.words.len()))
        .collect();
    let recv_sizes = timers.time(timed, SetupPhase::SizeExchange, || {
        exchange_counts(&outgoing, &recv_procs, comm, TAG_BUFFER)
    })?;

    barrier();
    let incoming = recv_procs
        .iter()
        .map(|&p| {
            recv_sizes
                .get(&p)
                .map(|&n| (p, n))
                .ok_or_else(|| CompGridError::comm(p, "no buffer size received"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let payload: Vec<(usize, &[WireWord])> = send_procs
        .iter()
        .zip(&packed)
        .map(|(&p, b)| (p, b.words.as_slice()))
        .collect();
    let received = timers.time(timed, SetupPhase::BufferExchange, || {
        exchange_words(&payload, &incoming, comm, TAG_BUFFER.offset(1))
    })?;
    drop(payload);

    barrier();
    let outcomes = timers.time(timed, SetupPhase::Unpack, || {
        received
            .iter()
            .map(|words| unpack_recv_buffer(words, grids, level))
            .collect::<Result<Vec<_>, _>>()
    })?;
    if params.debug_checks {
        for grid in &grids[level..] {
            grid.validate_invariants()?;
        }
    }

    barrier();
    timers.time(timed, SetupPhase::LocalIndices, || {
        for l in level..num_levels {
            let (fine, rest) = grids.split_at_mut(l + 1);
            fine[l].finalize_local_indices(rest.first());
        }
        if level == 0 {
            for l in 0..num_levels.saturating_sub(1) {
                let (fine, rest) = grids.split_at_mut(l + 1);
                fine[l].finalize_local_indices_p(&rest[0]);
            }
        }
    });

    barrier();
    timers.time(timed, SetupPhase::SendMapCorrection, || {
        let replies = outcomes
            .iter()
            .map(|o| pack_recv_map_send_buffer(&o.recv_map_send, level))
            .collect::<Result<Vec<_>, _>>()?;
        let out: Vec<(usize, &[WireWord])> = recv_procs
            .iter()
            .zip(&replies)
            .map(|(&p, w)| (p, w.as_slice()))
            .collect();
        let expect: Vec<(usize, usize)> = send_procs
            .iter()
            .zip(&packed)
            .map(|(&p, b)| (p, b.send_flag_buffer_size))
            .collect();
        let flags_back = exchange_words(&out, &expect, comm, TAG_SEND_MAP)?;

        let lp = pkg.level_mut(level);
        lp.send_buffer_size = Vec::with_capacity(packed.len());
        for (buf, words) in packed.iter_mut().zip(&flags_back) {
            lp.send_buffer_size
                .push(unpack_send_flag_buffer(words, &mut buf.send_flag, level)?);
        }
        lp.send_flag = packed.into_iter().map(|b| b.send_flag).collect();
        lp.recv_map = outcomes
            .iter()
            .map(|o| {
                o.recv_map_send
                    .iter()
                    .map(|dest| dest.iter().flatten().copied().collect())
                    .collect()
            })
            .collect();
        lp.recv_buffer_size = lp
            .recv_map
            .iter()
            .map(|per_level: &Vec<Vec<_>>| (num_levels - level) + per_level.iter().map(Vec::len).sum::<usize>())
            .collect();
        Ok::<_, CompGridError>(())
    })?;

    log::debug!(
        "level {level}: rank {} exchanged with {} neighbor(s), {} new node(s)",
        comm.rank(),
        recv_procs.len(),
        outcomes.iter().map(|o| o.num_recv_nodes.iter().sum::<usize>()).sum::<usize>()
    );
    Ok(errors)
}
