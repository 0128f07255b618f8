/// The error type for [`SnapMap::compare_and_swap`][cas] and
/// [`SnapMap::compare_and_delete`][cad].
///
/// [cas]: ./struct.SnapMap.html#method.compare_and_swap
/// [cad]: ./struct.SnapMap.html#method.compare_and_delete
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareError {
    /// No live value is associated with the key.
    #[error("no value is associated with the key")]
    Absent,

    /// A value is associated with the key, but it does not equal the expected
    /// one.
    #[error("the current value does not match the expected value")]
    Mismatch,
}
