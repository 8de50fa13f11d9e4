/// Splits `devices` into consecutive batches of at most `batch_size`,
/// preserving order. Every device lands in exactly one batch.
pub fn batch_devices(devices: &[String], batch_size: usize) -> Vec<Vec<String>> {
    devices
        .chunks(batch_size.max(1))
        .map(<[String]>::to_vec)
        .collect()
}
