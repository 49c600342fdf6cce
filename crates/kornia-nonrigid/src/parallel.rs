use rayon::prelude::*;

/// Number of elements reduced sequentially by a single task.
const CHUNK_SIZE: usize = 4096;

/// Dot product of two vectors.
///
/// Partial sums are computed over fixed-size chunks and combined in order, so the
/// result does not depend on the number of worker threads.
pub(crate) fn par_dot(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    let partial_sums = a
        .par_chunks(CHUNK_SIZE)
        .zip(b.par_chunks(CHUNK_SIZE))
        .map(|(ca, cb)| ca.iter().zip(cb.iter()).map(|(x, y)| x * y).sum::<f64>())
        .collect::<Vec<_>>();
    partial_sums.iter().sum()
}

/// Sum of `f` over all items, reduced over fixed-size chunks like [`par_dot`].
pub(crate) fn par_sum<T, F>(items: &[T], f: F) -> f64
where
    T: Sync,
    F: Fn(usize, &T) -> f64 + Sync + Send,
{
    let partial_sums = items
        .par_chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(chunk, values)| {
            let offset = chunk * CHUNK_SIZE;
            values
                .iter()
                .enumerate()
                .map(|(i, v)| f(offset + i, v))
                .sum::<f64>()
        })
        .collect::<Vec<_>>();
    partial_sums.iter().sum()
}

/// `y += alpha * x`
pub(crate) fn par_axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    assert_eq!(x.len(), y.len());
    y.par_iter_mut()
        .zip(x.par_iter())
        .for_each(|(yi, xi)| *yi += alpha * xi);
}

/// Maximum of `f` over all items, or zero for an empty slice.
///
/// `f` is expected to return non-negative values.
pub(crate) fn par_max<T, F>(items: &[T], f: F) -> f64
where
    T: Sync,
    F: Fn(&T) -> f64 + Sync + Send,
{
    items.par_iter().map(f).reduce(|| 0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_par_dot() {
        let a = (0..10_000).map(|i| i as f64 * 1e-3).collect::<Vec<_>>();
        let b = vec![2.0; a.len()];
        let expected = a.iter().map(|x| 2.0 * x).sum::<f64>();
        assert!((par_dot(&a, &b) - expected).abs() < 1e-6);
        assert_eq!(par_dot(&[], &[]), 0.0);
    }

    #[test]
    fn test_par_sum_is_independent_of_thread_count() -> Result<(), rayon::ThreadPoolBuildError> {
        let values = (0..20_000)
            .map(|i| ((i * 7919) % 1000) as f64 * 1e-3 + 1e-9 * i as f64)
            .collect::<Vec<_>>();
        let weighted = |i: usize, v: &f64| v * (1.0 + (i % 3) as f64);

        let sequential = values
            .chunks(CHUNK_SIZE)
            .enumerate()
            .map(|(chunk, c)| {
                c.iter()
                    .enumerate()
                    .map(|(i, v)| weighted(chunk * CHUNK_SIZE + i, v))
                    .sum::<f64>()
            })
            .sum::<f64>();

        let single = rayon::ThreadPoolBuilder::new().num_threads(1).build()?;
        let many = rayon::ThreadPoolBuilder::new().num_threads(4).build()?;
        let a = single.install(|| par_sum(&values, weighted));
        let b = many.install(|| par_sum(&values, weighted));
        assert_eq!(a.to_bits(), b.to_bits());
        assert_eq!(a.to_bits(), sequential.to_bits());
        assert_eq!(par_sum::<f64, _>(&[], |_, v| *v), 0.0);
        Ok(())
    }

    #[test]
    fn test_par_axpy() {
        let x = vec![1.0, 2.0, 3.0];
        let mut y = vec![1.0, 1.0, 1.0];
        par_axpy(2.0, &x, &mut y);
        assert_eq!(y, vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_par_max() {
        let values = vec![0.5, 3.0, 1.0, 2.5];
        assert_eq!(par_max(&values, |v| *v), 3.0);
        assert_eq!(par_max::<f64, _>(&[], |v| *v), 0.0);
    }
}
