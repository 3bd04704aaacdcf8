use std::collections::HashMap;

use iga_core::{IgaError, Result};

use crate::extension::Extension;

/// Communication groups of a partitioned space.
///
/// Group 0 always holds just the owning rank; every other group is the
/// sorted set of ranks sharing at least one DOF.
#[derive(Debug, Clone)]
pub struct GroupTopology {
    my_rank: usize,
    groups: Vec<Vec<usize>>,
}

impl GroupTopology {
    fn new(my_rank: usize) -> GroupTopology {
        GroupTopology {
            my_rank,
            groups: vec![vec![my_rank]],
        }
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, g: usize) -> &[usize] {
        &self.groups[g]
    }

    /// True when the group holds only the owning rank.
    pub fn is_local(&self, g: usize) -> bool {
        g == 0
    }
}

/// One rank's piece of a partitioned spline space.
///
/// The underlying [`Extension`] keeps the global lattice but activates only
/// the elements assigned to this rank; [`ParExtension::ldof_group`] maps each
/// local DOF to the group of ranks that share it.
#[derive(Debug, Clone)]
pub struct ParExtension {
    ext: Extension,
    my_rank: usize,
    partitioning: Vec<usize>,
    gtopo: GroupTopology,
    ldof_group: Vec<usize>,
}

impl ParExtension {
    /// Restrict a fully active global space to the elements `partitioning`
    /// assigns to `my_rank`. `active_bdr` marks the boundary elements this
    /// rank keeps.
    pub fn from_partition(
        my_rank: usize,
        parent: &Extension,
        partitioning: &[usize],
        active_bdr: &[bool],
    ) -> Result<ParExtension> {
        if parent.num_elements() != parent.total_elements() {
            return Err(IgaError::InvalidOperation(
                "partitioning needs a fully active space".into(),
            ));
        }
        if partitioning.len() != parent.total_elements() {
            return Err(IgaError::Inconsistent(format!(
                "partitioning lists {} elements, the space has {}",
                partitioning.len(),
                parent.total_elements()
            )));
        }

        let mut ext = parent.clone();
        ext.set_active(partitioning.iter().map(|&r| r == my_rank).collect());
        ext.set_active_bdr(active_bdr.to_vec());
        ext.generate_active_vertices();
        ext.generate_element_dof_table();
        ext.generate_bdr_element_dof_table();

        // The parent is fully active, so its DOF rows are in identified
        // numbering and double as the global table.
        let mut weights = vec![1.0; ext.num_dofs()];
        for (lel, &gel) in ext.element_local_to_global().iter().enumerate() {
            let ldofs = ext.element_dofs(lel);
            let gdofs = parent.element_dofs(gel);
            for (l, g) in ldofs.iter().zip(gdofs) {
                weights[*l as usize] = parent.weights()[*g as usize];
            }
        }
        ext.set_weights(weights);

        let (gtopo, ldof_group) = build_groups(&ext, my_rank, partitioning);
        Ok(ParExtension {
            ext,
            my_rank,
            partitioning: partitioning.to_vec(),
            gtopo,
            ldof_group,
        })
    }

    /// Re-partition a refined serial space the same way as `par_parent`.
    /// `local` is typically fully active with full weights; its activity is
    /// replaced by the parent's partition before the tables are rebuilt.
    pub fn from_serial(local: Extension, par_parent: &ParExtension) -> Result<ParExtension> {
        if local.total_elements() != par_parent.partitioning.len() {
            return Err(IgaError::Inconsistent(
                "partition does not match the refined element count".into(),
            ));
        }
        let my_rank = par_parent.my_rank;
        let mut ext = local;

        let needs_restriction = ext.num_elements() == ext.total_elements();
        if needs_restriction {
            let global_weights = ext.weights().to_vec();
            let global_table = ext.global_element_dof_table();

            ext.set_active(
                par_parent
                    .partitioning
                    .iter()
                    .map(|&r| r == my_rank)
                    .collect(),
            );
            ext.set_active_bdr(par_parent.ext.bdr_activity());
            ext.generate_active_vertices();
            ext.generate_element_dof_table();
            ext.generate_bdr_element_dof_table();

            let mut weights = vec![1.0; ext.num_dofs()];
            for (lel, &gel) in ext.element_local_to_global().iter().enumerate() {
                let ldofs = ext.element_dofs(lel);
                let gdofs = global_table.row(gel);
                for (l, g) in ldofs.iter().zip(gdofs) {
                    weights[*l as usize] = global_weights[*g as usize];
                }
            }
            ext.set_weights(weights);
        }

        let (gtopo, ldof_group) = build_groups(&ext, my_rank, &par_parent.partitioning);
        Ok(ParExtension {
            ext,
            my_rank,
            partitioning: par_parent.partitioning.clone(),
            gtopo,
            ldof_group,
        })
    }

    pub fn space(&self) -> &Extension {
        &self.ext
    }

    pub fn space_mut(&mut self) -> &mut Extension {
        &mut self.ext
    }

    pub fn into_space(self) -> Extension {
        self.ext
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn partitioning(&self) -> &[usize] {
        &self.partitioning
    }

    pub fn group_topology(&self) -> &GroupTopology {
        &self.gtopo
    }

    /// Group of each local DOF, indexed by active DOF number.
    pub fn ldof_group(&self) -> &[usize] {
        &self.ldof_group
    }
}

/// For every local DOF, collect the sorted set of ranks whose elements touch
/// it and intern the set as a group.
fn build_groups(
    ext: &Extension,
    my_rank: usize,
    partitioning: &[usize],
) -> (GroupTopology, Vec<usize>) {
    let global = ext.global_element_dof_table();
    let mut dof_elems: Vec<Vec<usize>> = vec![Vec::new(); ext.total_dofs()];
    for (el, row) in global.rows().enumerate() {
        for &d in row {
            dof_elems[d as usize].push(el);
        }
    }

    let mut gtopo = GroupTopology::new(my_rank);
    let mut interned: HashMap<Vec<usize>, usize> = HashMap::new();
    let mut ldof_group = vec![0usize; ext.num_dofs()];

    for (d, elems) in dof_elems.iter().enumerate() {
        let active = ext.active_dof_index(d);
        if active <= 0 {
            continue;
        }
        let mut procs: Vec<usize> = elems.iter().map(|&e| partitioning[e]).collect();
        procs.sort_unstable();
        procs.dedup();
        let gid = if procs == [my_rank] {
            0
        } else {
            match interned.get(&procs) {
                Some(&g) => g,
                None => {
                    let g = gtopo.groups.len();
                    gtopo.groups.push(procs.clone());
                    interned.insert(procs, g);
                    g
                }
            }
        };
        ldof_group[(active - 1) as usize] = gid;
    }
    (gtopo, ldof_group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_zero_is_the_owner_alone() {
        let g = GroupTopology::new(3);
        assert_eq!(g.num_groups(), 1);
        assert_eq!(g.group(0), &[3]);
        assert!(g.is_local(0));
    }
}
