use super::ceil_div;

/// Fixed size set of bits, used as slot occupancy map
pub(crate) struct BitArray {
    arr: Vec<u8>,
    len: usize,
}

impl BitArray {
    /// Creates a bit array of `len` bits, all unset
    pub(crate) fn new(len: usize) -> Self {
        BitArray {
            arr: vec![0; ceil_div(len, 8)],
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn set(&mut self, value: bool, index: usize) {
        debug_assert!(index < self.len, "index {} out of bounds ({})", index, self.len);
        let arr_index = index / 8;
        let internal_index = index % 8;

        let item = &mut self.arr[arr_index];
        if value {
            // set bit
            *item |= 1u8 << internal_index;
        } else {
            // unset bit
            *item &= !(1u8 << internal_index);
        }
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        let arr_index = index / 8;
        let internal_index = index % 8;

        let item = self.arr[arr_index];
        (item & (1u8 << internal_index)) != 0
    }

    /// Lowest index whose bit is unset
    pub(crate) fn first_unset(&self) -> Option<usize> {
        for (arr_index, item) in self.arr.iter().enumerate() {
            if *item == u8::MAX {
                continue;
            }

            let index = arr_index * 8 + item.trailing_ones() as usize;
            return if index < self.len { Some(index) } else { None };
        }

        None
    }

    pub(crate) fn count_set(&self) -> usize {
        self.arr.iter().map(|item| item.count_ones() as usize).sum()
    }
}
