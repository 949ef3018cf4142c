//! Per-level communication package of the composite grids.
//!
//! Discovery fills the neighbor lists and send maps; the orchestrator then
//! stores what every later solve-phase exchange needs: which nodes of which
//! level go to which neighbor (`send_flag`) and where received nodes live
//! (`recv_map`).

use super::grid::NodeHandle;

/// Communication pattern of one level.
///
/// `send_map_elmts[send_map_starts[i]..send_map_starts[i + 1]]` are the owned
/// nodes whose distance region is sent to `send_procs[i]`, with
/// `ghost_marker` set for the ones that lie only in the ghost layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelCommPkg {
    pub send_procs: Vec<usize>,
    pub recv_procs: Vec<usize>,
    pub send_map_starts: Vec<usize>,
    pub send_map_elmts: Vec<NodeHandle>,
    pub ghost_marker: Vec<bool>,
    /// `[proc][psi level]` nodes sent to `send_procs[proc]`; levels above this one stay empty.
    pub send_flag: Vec<Vec<Vec<NodeHandle>>>,
    /// `[proc][psi level]` nodes received from `recv_procs[proc]`.
    pub recv_map: Vec<Vec<Vec<NodeHandle>>>,
    /// Words per solve-phase residual message sent from this level.
    pub send_buffer_size: Vec<usize>,
    pub recv_buffer_size: Vec<usize>,
}

impl LevelCommPkg {
    /// Empty pattern: the rank exchanges nothing on this level.
    pub fn empty() -> Self {
        Self {
            send_map_starts: vec![0],
            ..Default::default()
        }
    }

    pub fn num_sends(&self) -> usize {
        self.send_procs.len()
    }

    pub fn num_recvs(&self) -> usize {
        self.recv_procs.len()
    }

    pub fn send_slice(&self, i: usize) -> &[NodeHandle] {
        &self.send_map_elmts[self.send_map_starts[i]..self.send_map_starts[i + 1]]
    }

    pub fn ghost_slice(&self, i: usize) -> &[bool] {
        &self.ghost_marker[self.send_map_starts[i]..self.send_map_starts[i + 1]]
    }

    /// `num_send_nodes[proc][psi level]`.
    pub fn num_send_nodes(&self) -> Vec<Vec<usize>> {
        self.send_flag
            .iter()
            .map(|per_level| per_level.iter().map(Vec::len).collect())
            .collect()
    }

    pub fn num_recv_nodes(&self) -> Vec<Vec<usize>> {
        self.recv_map
            .iter()
            .map(|per_level| per_level.iter().map(Vec::len).collect())
            .collect()
    }

    /// `true` when the send and receive neighbor sets coincide.
    pub fn is_symmetric(&self) -> bool {
        let mut s = self.send_procs.clone();
        let mut r = self.recv_procs.clone();
        s.sort_unstable();
        r.sort_unstable();
        s == r
    }
}

/// Communication packages of every level.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompGridCommPkg {
    levels: Vec<LevelCommPkg>,
}

impl CompGridCommPkg {
    pub fn new(num_levels: usize) -> Self {
        Self {
            levels: vec![LevelCommPkg::empty(); num_levels],
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &LevelCommPkg {
        &self.levels[level]
    }

    pub fn level_mut(&mut self, level: usize) -> &mut LevelCommPkg {
        &mut self.levels[level]
    }

    pub fn levels(&self) -> &[LevelCommPkg] {
        &self.levels
    }

    pub fn send_slice(&self, level: usize, i: usize) -> &[NodeHandle] {
        self.levels[level].send_slice(i)
    }

    pub fn ghost_slice(&self, level: usize, i: usize) -> &[bool] {
        self.levels[level].ghost_slice(i)
    }

    pub fn is_symmetric(&self, level: usize) -> bool {
        self.levels[level].is_symmetric()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_follow_map_starts() {
        let h = NodeHandle::new;
        let pkg = LevelCommPkg {
            send_procs: vec![0, 2],
            recv_procs: vec![2, 0],
            send_map_starts: vec![0, 1, 3],
            send_map_elmts: vec![h(0), h(1), h(2)],
            ghost_marker: vec![false, false, true],
            ..Default::default()
        };
        assert_eq!(pkg.send_slice(1), &[h(1), h(2)]);
        assert_eq!(pkg.ghost_slice(1), &[false, true]);
        assert!(pkg.is_symmetric());
    }

    #[test]
    fn node_counts_mirror_flags() {
        let h = NodeHandle::new;
        let mut pkg = CompGridCommPkg::new(2);
        pkg.level_mut(0).send_flag = vec![vec![vec![h(0), h(1)], vec![h(0)]]];
        assert_eq!(pkg.level(0).num_send_nodes(), vec![vec![2, 1]]);
        assert_eq!(pkg.level(1).num_sends(), 0);
        assert_eq!(pkg.level(1).send_map_starts, vec![0]);
    }
}
