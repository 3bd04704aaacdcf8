/// Union-find over DOF indices, used to identify DOFs across periodic
/// boundaries. Roots are always the smallest index of their class, so the
/// identification is order-independent.
#[derive(Debug, Clone)]
pub struct DofMerger {
    parent: Vec<usize>,
}

impl DofMerger {
    pub fn new(num_dofs: usize) -> Self {
        DofMerger {
            parent: (0..num_dofs).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, mut d: usize) -> usize {
        while self.parent[d] != d {
            self.parent[d] = self.parent[self.parent[d]];
            d = self.parent[d];
        }
        d
    }

    /// Identify two DOFs. The smaller root wins.
    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }

    /// Renumber classes densely in ascending order of their smallest member.
    /// Returns the old-to-new map and the number of classes.
    pub fn compact(&mut self) -> (Vec<usize>, usize) {
        let n = self.parent.len();
        let mut map = vec![usize::MAX; n];
        let mut count = 0;
        for d in 0..n {
            let r = self.find(d);
            if map[r] == usize::MAX {
                map[r] = count;
                count += 1;
            }
            map[d] = map[r];
        }
        (map, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_to_smallest_root() {
        let mut m = DofMerger::new(6);
        m.union(4, 1);
        m.union(5, 4);
        assert_eq!(m.find(5), 1);
        assert_eq!(m.find(4), 1);
        assert_eq!(m.find(2), 2);
    }

    #[test]
    fn compacts_in_ascending_canonical_order() {
        let mut m = DofMerger::new(5);
        m.union(3, 0);
        m.union(4, 2);
        let (map, count) = m.compact();
        assert_eq!(count, 3);
        assert_eq!(map, vec![0, 1, 2, 0, 2]);
    }

    #[test]
    fn chained_unions_collapse_to_one_class() {
        let mut m = DofMerger::new(4);
        m.union(0, 1);
        m.union(1, 2);
        m.union(2, 3);
        let (map, count) = m.compact();
        assert_eq!(count, 1);
        assert!(map.iter().all(|&v| v == 0));
    }
}
