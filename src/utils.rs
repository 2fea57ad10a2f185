pub fn pretty_print_num(num: usize) -> String {
    match num {
        1_000_000_000_000.. => format!("{:.2}T", num as f64 / 1_000_000_000_000.),
        1_000_000_000..=999_999_999_999 => format!("{:.2}B", num as f64 / 1_000_000_000.),
        1_000_000..=999_999_999 => format!("{:.2}M", num as f64 / 1_000_000.),
        1_000..=999_999 => format!("{:.2}K", num as f64 / 1_000.),
        _ => num.to_string(),
    }
}

/// In-place softmax of `distr / temperature`.
pub fn softmax(distr: &mut [f32], temperature: f32) {
    let max = distr.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = distr.iter().map(|i| ((i - max) / temperature).exp()).sum();
    for i in distr {
        *i = ((*i - max) / temperature).exp() / sum;
    }
}

/// Index of the largest value, the first one on ties. `0` for an empty slice.
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, v)| {
            if *v > best_v {
                (i, *v)
            } else {
                (best, best_v)
            }
        })
        .0
}
