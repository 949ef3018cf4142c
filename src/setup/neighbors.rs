//! Nearest-processor-neighbor discovery.
//!
//! Starting from the one-hop pattern of `A`, every rank grows, per neighbor,
//! the set of owned nodes lying within `padding + num_ghost_layers` of that
//! neighbor's nodes. Searches that leave the rank become requests which the
//! owners continue in the next round. A request that lands on nodes of a rank
//! that is not yet a neighbor makes it one.

use super::distance_search::{RequestList, expand_neighbors};
use super::{SetupParams, TAG_DISCOVERY, TAG_SYMMETRY};
use crate::algs::communicator::Communicator;
use crate::algs::exchange::{broadcast_words, exchange_counts, exchange_words};
use crate::algs::wire::{WireReader, WireWord, WireWriter};
use crate::comp_grid::{CompGrid, CompGridCommPkg, LevelCommPkg, NodeHandle};
use crate::compgrid_error::CompGridError;
use crate::hierarchy::{CsrCommPkg, ParCsrMatrix};
use std::collections::BTreeMap;

/// Search state kept for one (possibly discovered) neighbor.
#[derive(Debug)]
struct NeighborRecord {
    /// Remaining distance budget per owned node; `> 0` means the node is sent.
    add_flag: Vec<usize>,
    starting_nodes: Vec<NodeHandle>,
    requests: RequestList,
    search: bool,
}

impl NeighborRecord {
    fn new(num_owned: usize) -> Self {
        Self {
            add_flag: vec![0; num_owned],
            starting_nodes: Vec::new(),
            requests: RequestList::new(),
            search: true,
        }
    }
}

/// Fill `pkg.level_mut(level)` with the neighbors and send maps of `level`.
///
/// `grid` must hold only the owned nodes (discovery runs before any merge).
/// With `params.debug_checks` the initial pattern and the result are checked
/// for symmetry across all ranks; that check is collective.
pub fn setup_nearest_processor_neighbors<C>(
    a: &ParCsrMatrix,
    grid: &CompGrid,
    pkg: &mut CompGridCommPkg,
    level: usize,
    params: &SetupParams,
    comm: &C,
) -> Result<(), CompGridError>
where
    C: Communicator,
{
    let csr = &a.comm_pkg;
    let initial_check = if params.debug_checks {
        check_local_symmetry(csr, level, comm.rank())
    } else {
        Ok(())
    };

    let result = if csr.num_sends() == 0 {
        log::debug!("level {level}: rank {} has no neighbors", comm.rank());
        Ok(LevelCommPkg::empty())
    } else {
        discover(csr, grid, level, params, comm)
    };

    // collective, so every rank gets here even when a local step failed
    let cross_check = if params.debug_checks {
        let sends = result
            .as_ref()
            .map(|p| p.send_procs.clone())
            .unwrap_or_default();
        check_cross_rank_symmetry(&sends, level, comm)
    } else {
        Ok(())
    };

    let level_pkg = result?;
    initial_check?;
    cross_check?;
    log::debug!(
        "level {level}: rank {} sends to {:?} ({} nodes)",
        comm.rank(),
        level_pkg.send_procs,
        level_pkg.send_map_elmts.len()
    );
    *pkg.level_mut(level) = level_pkg;
    Ok(())
}

fn discover<C>(
    csr: &CsrCommPkg,
    grid: &CompGrid,
    level: usize,
    params: &SetupParams,
    comm: &C,
) -> Result<LevelCommPkg, CompGridError>
where
    C: Communicator,
{
    let num_owned = grid.num_owned_nodes();
    let reach = params.padding + params.num_ghost_layers;
    let mut records: BTreeMap<usize, NeighborRecord> = BTreeMap::new();
    for (i, &proc) in csr.send_procs.iter().enumerate() {
        let rec = records
            .entry(proc)
            .or_insert_with(|| NeighborRecord::new(num_owned));
        for &elmt in csr.send_elmts(i) {
            if elmt >= num_owned {
                return Err(CompGridError::LevelMismatch {
                    level,
                    reason: format!("send map element {elmt} is not an owned row"),
                });
            }
            rec.add_flag[elmt] = reach;
            rec.starting_nodes.push(NodeHandle::new(elmt));
        }
    }

    let neighbors = csr.send_procs.clone();
    for round in 0..reach.saturating_sub(1) {
        find_neighbor_processors(grid, &mut records, &neighbors, comm)?;
        log::trace!(
            "level {level} round {round}: rank {} tracks {} neighbor(s)",
            comm.rank(),
            records.len()
        );
    }

    let mut out = LevelCommPkg::empty();
    for (proc, rec) in &records {
        out.send_procs.push(*proc);
        for (i, &flag) in rec.add_flag.iter().enumerate() {
            if flag > 0 {
                out.send_map_elmts.push(NodeHandle::new(i));
                out.ghost_marker.push(flag <= params.num_ghost_layers);
            }
        }
        out.send_map_starts.push(out.send_map_elmts.len());
    }
    out.recv_procs = out.send_procs.clone();
    Ok(out)
}

/// One discovery round: search locally, exchange requests with the original
/// neighbors, and fold the requests aimed at this rank into `records`.
fn find_neighbor_processors<C>(
    grid: &CompGrid,
    records: &mut BTreeMap<usize, NeighborRecord>,
    neighbors: &[usize],
    comm: &C,
) -> Result<(), CompGridError>
where
    C: Communicator,
{
    for rec in records.values_mut().filter(|r| r.search) {
        rec.requests.clear();
        for node in std::mem::take(&mut rec.starting_nodes) {
            let m = rec.add_flag[node.index()];
            if m > 1 {
                expand_neighbors(grid, node, m - 1, &mut rec.add_flag, &mut rec.requests);
            }
        }
    }

    let words = pack_requests(records)?;
    let outgoing: Vec<(usize, usize)> = neighbors.iter().map(|&p| (p, words.len())).collect();
    let sizes = exchange_counts(&outgoing, neighbors, comm, TAG_DISCOVERY)?;
    let incoming = neighbors
        .iter()
        .map(|&p| {
            sizes
                .get(&p)
                .map(|&n| (p, n))
                .ok_or_else(|| CompGridError::comm(p, "no request size received"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let payload: Vec<(usize, &[WireWord])> = neighbors.iter().map(|&p| (p, words.as_slice())).collect();
    let received = exchange_words(&payload, &incoming, comm, TAG_DISCOVERY.offset(1))?;

    for rec in records.values_mut() {
        rec.search = false;
    }
    for buf in &received {
        merge_requests(buf, grid, records, comm.rank())?;
    }
    Ok(())
}

/// `[num_procs, (proc, n, (global, distance) x n) ...]` over searched neighbors with requests.
fn pack_requests(records: &BTreeMap<usize, NeighborRecord>) -> Result<Vec<WireWord>, CompGridError> {
    let active: Vec<(&usize, &NeighborRecord)> = records
        .iter()
        .filter(|(_, r)| r.search && !r.requests.is_empty())
        .collect();
    let len = 1 + active.iter().map(|(_, r)| 2 * r.requests.len() + 2).sum::<usize>();
    let mut w = WireWriter::with_exact_len(len);
    w.put_len(active.len());
    for (&proc, rec) in active {
        w.put_len(proc);
        w.put_len(rec.requests.len());
        for (g, d) in rec.requests.iter() {
            w.put_int(g);
            w.put_len(d);
        }
    }
    w.finish()
}

fn merge_requests(
    buf: &[WireWord],
    grid: &CompGrid,
    records: &mut BTreeMap<usize, NeighborRecord>,
    me: usize,
) -> Result<(), CompGridError> {
    let owned = grid.owned_range();
    let mut r = WireReader::new(buf);
    let num_procs = r.len_value("request proc count")?;
    for _ in 0..num_procs {
        let proc = r.len_value("request proc")?;
        let n = r.len_value("request count")?;
        let mut pairs = Vec::with_capacity(n);
        for _ in 0..n {
            let g = r.int()?;
            let d = r.len_value("request distance")?;
            pairs.push((g, d));
        }
        if proc == me {
            continue;
        }
        if !records.contains_key(&proc) {
            if !pairs.iter().any(|(g, _)| owned.contains(g)) {
                continue;
            }
            log::trace!("rank {me} discovered neighbor {proc}");
            let mut rec = NeighborRecord::new(grid.num_owned_nodes());
            rec.search = false;
            records.insert(proc, rec);
        }
        let Some(rec) = records.get_mut(&proc) else {
            continue;
        };
        for (g, d) in pairs {
            if !owned.contains(&g) {
                continue;
            }
            let i = (g - owned.start) as usize;
            if d > rec.add_flag[i] {
                rec.add_flag[i] = d;
                rec.starting_nodes.push(NodeHandle::new(i));
                rec.search = true;
            }
        }
    }
    if r.remaining() != 0 {
        return Err(CompGridError::WireLengthMismatch {
            expected: r.position(),
            actual: buf.len(),
        });
    }
    Ok(())
}

fn check_local_symmetry(csr: &CsrCommPkg, level: usize, rank: usize) -> Result<(), CompGridError> {
    if csr.is_symmetric() {
        return Ok(());
    }
    let peer = csr
        .send_procs
        .iter()
        .chain(&csr.recv_procs)
        .copied()
        .find(|p| !csr.send_procs.contains(p) || !csr.recv_procs.contains(p))
        .unwrap_or(rank);
    log::error!("level {level}: initial pattern of rank {rank} is not symmetric (rank {peer})");
    Err(CompGridError::AsymmetricTopology { level, rank, peer })
}

/// Every rank publishes its send list; each then checks that its neighbors list it back.
fn check_cross_rank_symmetry<C>(sends: &[usize], level: usize, comm: &C) -> Result<(), CompGridError>
where
    C: Communicator,
{
    let me = comm.rank();
    let mine: Vec<WireWord> = sends.iter().map(|&p| WireWord::from_int(p as i64)).collect();
    let mut lists = Vec::with_capacity(comm.size());
    for root in 0..comm.size() {
        let words = broadcast_words(root, (root == me).then_some(mine.as_slice()), comm, TAG_SYMMETRY)?;
        lists.push(words.iter().map(|w| w.int()).collect::<Vec<i64>>());
    }
    for &peer in sends {
        let listed = lists.get(peer).is_some_and(|l| l.contains(&(me as i64)));
        if !listed {
            log::error!("level {level}: rank {me} sends to rank {peer} but not the reverse");
            return Err(CompGridError::AsymmetricTopology { level, rank: me, peer });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};
    use crate::hierarchy::{AmgLevel, RowPartition, SparseRow};

    fn chain_level(part: &RowPartition, rank: usize) -> AmgLevel {
        let total = part.total();
        let rows = (part.first(rank)..part.end(rank))
            .map(|g| {
                let cols: Vec<i64> = [g - 1, g, g + 1].into_iter().filter(|c| (0..total).contains(c)).collect();
                let vals = cols.iter().map(|&c| if c == g { 2.0 } else { -1.0 }).collect();
                SparseRow::new(cols, vals)
            })
            .collect();
        AmgLevel {
            a: ParCsrMatrix::distributed(rows, part, rank),
            residual: vec![0.0; part.len_of(rank)],
            ..Default::default()
        }
    }

    #[test]
    fn single_rank_gets_an_empty_pattern() {
        let part = RowPartition::uniform(4, 1);
        let lv = chain_level(&part, 0);
        let grid = CompGrid::from_level(0, &lv).unwrap();
        let mut pkg = CompGridCommPkg::new(1);
        let params = SetupParams {
            debug_checks: true,
            ..Default::default()
        };
        setup_nearest_processor_neighbors(&lv.a, &grid, &mut pkg, 0, &params, &NoComm).unwrap();
        assert_eq!(pkg.level(0).num_sends(), 0);
    }

    #[test]
    fn asymmetric_input_is_rejected() {
        let csr = CsrCommPkg {
            send_procs: vec![1],
            send_map_starts: vec![0, 0],
            send_map_elmts: vec![],
            recv_procs: vec![2],
        };
        assert!(matches!(
            check_local_symmetry(&csr, 3, 0),
            Err(CompGridError::AsymmetricTopology { level: 3, rank: 0, peer: 1 })
        ));
    }

    #[test]
    fn padding_two_reaches_past_a_thin_rank() {
        // r0 {0,1,2}, r1 {3}, r2 {4,5,6}
        let part = RowPartition::from_starts(vec![0, 3, 4], 7).unwrap();
        let comms = RayonComm::world(3);
        let params = SetupParams {
            padding: 2,
            num_ghost_layers: 1,
            debug_checks: true,
            ..Default::default()
        };
        let pkgs: Vec<CompGridCommPkg> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    let part = &part;
                    let params = &params;
                    s.spawn(move || {
                        let lv = chain_level(part, c.rank());
                        let grid = CompGrid::from_level(0, &lv).unwrap();
                        let mut pkg = CompGridCommPkg::new(1);
                        setup_nearest_processor_neighbors(&lv.a, &grid, &mut pkg, 0, params, c).unwrap();
                        pkg
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let r2 = pkgs[2].level(0);
        assert_eq!(r2.send_procs, vec![0, 1]);
        // rank 0 needs 4 (distance 2 from node 2, real) and 5 (ghost)
        let h = NodeHandle::new;
        assert_eq!(r2.send_slice(0), &[h(0), h(1)]);
        assert_eq!(r2.ghost_slice(0), &[false, true]);
        assert_eq!(pkgs[0].level(0).send_procs, vec![1, 2]);
        assert!(pkgs.iter().all(|p| p.is_symmetric(0)));
    }
}
