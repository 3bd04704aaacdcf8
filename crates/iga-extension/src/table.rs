use serde::{Deserialize, Serialize};

/// Ragged row-major connectivity table.
///
/// Entries are signed: element-to-DOF tables encode an oriented DOF `d` as
/// `-1 - d` when its sign is flipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    offsets: Vec<usize>,
    data: Vec<isize>,
}

impl Table {
    /// Build from `(row, value)` pairs. Values keep their insertion order
    /// within each row; element DOF tables rely on that order and must never
    /// be sorted.
    pub fn from_connections(num_rows: usize, conns: &[(usize, isize)]) -> Table {
        let mut offsets = vec![0usize; num_rows + 1];
        for &(row, _) in conns {
            offsets[row + 1] += 1;
        }
        for i in 0..num_rows {
            offsets[i + 1] += offsets[i];
        }
        let mut cursor = offsets.clone();
        let mut data = vec![0isize; conns.len()];
        for &(row, value) in conns {
            data[cursor[row]] = value;
            cursor[row] += 1;
        }
        Table { offsets, data }
    }

    pub fn num_rows(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn num_entries(&self) -> usize {
        self.data.len()
    }

    pub fn row(&self, i: usize) -> &[isize] {
        &self.data[self.offsets[i]..self.offsets[i + 1]]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [isize] {
        &mut self.data[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Apply `f` to every entry in place.
    pub fn map_values(&mut self, mut f: impl FnMut(isize) -> isize) {
        for v in &mut self.data {
            *v = f(*v);
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &[isize]> {
        (0..self.num_rows()).map(move |i| self.row(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_within_rows() {
        let t = Table::from_connections(3, &[(0, 5), (2, 9), (0, 2), (2, -3), (0, 7)]);
        assert_eq!(t.num_rows(), 3);
        assert_eq!(t.row(0), &[5, 2, 7]);
        assert_eq!(t.row(1), &[] as &[isize]);
        assert_eq!(t.row(2), &[9, -3]);
    }

    #[test]
    fn map_values_rewrites_entries() {
        let mut t = Table::from_connections(1, &[(0, 1), (0, -2)]);
        t.map_values(|v| v * 10);
        assert_eq!(t.row(0), &[10, -20]);
    }
}
