use rand::Rng;
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;



#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync {
    fn gen_usize_range(range: Range<usize>) -> usize;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_usize_range(range: Range<usize>) -> usize {
        rand::rng().random_range(range)
    }
}

/// picks up to `count` distinct elements, each subset of that size being equally likely. The
///  order of the result is random as well.
pub fn sample<R: Random, T: Clone>(items: &[T], count: usize) -> Vec<T> {
    let mut pool = items.to_vec();
    let count = count.min(pool.len());

    // partial Fisher-Yates shuffle
    for i in 0..count {
        let j = R::gen_usize_range(i..pool.len());
        pool.swap(i, j);
    }

    pool.truncate(count);
    pool
}
