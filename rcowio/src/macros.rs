/// Generates big-endian element load/store functions over byte slices.
///
/// The index is an element index, not a byte offset: element `i` of width
/// `N` lives at bytes `[i*N, (i+1)*N)`.
#[macro_export]
macro_rules! be_impl_element_rw {
    ($($ty:ty),+ $(,)?) => {
        $(
            paste::paste! {
                #[inline(always)]
                pub fn [<load_ $ty _be>](buf: &[u8], idx: usize) -> $ty {
                    const N: usize = core::mem::size_of::<$ty>();
                    let at = idx * N;
                    <$ty>::from_be_bytes(buf[at..at + N].try_into().unwrap())
                }

                #[inline(always)]
                pub fn [<store_ $ty _be>](buf: &mut [u8], idx: usize, val: $ty) {
                    const N: usize = core::mem::size_of::<$ty>();
                    let at = idx * N;
                    buf[at..at + N].copy_from_slice(&val.to_be_bytes());
                }
            }
        )+
    };
}
