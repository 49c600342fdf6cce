/// Error types for the non-rigid ICP drivers.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NonRigidIcpError {
    /// Two parallel arrays do not have the same number of elements.
    #[error("Mismatched array lengths: {left_name} ({left_len}) != {right_name} ({right_len})")]
    MismatchedArrayLengths {
        /// Label for the left-hand array.
        left_name: &'static str,
        /// Length of the left-hand array.
        left_len: usize,
        /// Label for the right-hand array.
        right_name: &'static str,
        /// Length of the right-hand array.
        right_len: usize,
    },

    /// A neighborhood references an element that does not exist.
    #[error("Neighbor index {index} in {name} is out of bounds for {bound} elements")]
    NeighborIndexOutOfBounds {
        /// Label of the offending neighborhood list.
        name: &'static str,
        /// The out of bounds neighbor index.
        index: usize,
        /// Number of elements the index must stay below.
        bound: usize,
    },

    /// The initial transformation does not match the number of unknowns.
    #[error("Initial transformation has {actual} entries, expected {expected}")]
    InvalidTransformationCount {
        /// Number of unknowns of the registration problem.
        expected: usize,
        /// Number of transforms that were provided.
        actual: usize,
    },
}

/// Check that two parallel arrays have the same length.
pub(crate) fn check_lengths(
    left_name: &'static str,
    left_len: usize,
    right_name: &'static str,
    right_len: usize,
) -> Result<(), NonRigidIcpError> {
    if left_len != right_len {
        return Err(NonRigidIcpError::MismatchedArrayLengths {
            left_name,
            left_len,
            right_name,
            right_len,
        });
    }
    Ok(())
}
