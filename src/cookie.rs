// Cookie generation
//
// Every long lived GPU resource is stamped with a unique 64-bit
// identity at creation time. Caches key off of these instead of
// comparing pointers, which avoids ABA problems when a vulkan handle
// is recycled into a new resource.

use std::sync::atomic::{AtomicU64, Ordering};

/// The process-wide cookie counter.
///
/// Cookie 0 is reserved to mean "no identity", so the counter is
/// always bumped before a value is handed out.
static COOKIE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stride between cookies. The low four bits are left clear for
/// future tagging.
const COOKIE_STRIDE: u64 = 16;

/// Generate the next resource cookie.
pub fn generate_cookie() -> u64 {
    COOKIE_COUNTER.fetch_add(COOKIE_STRIDE, Ordering::Relaxed) + COOKIE_STRIDE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_are_monotonic() {
        let first = generate_cookie();
        let second = generate_cookie();
        assert!(second > first);
        assert!(second - first >= 16);
        assert_ne!(first, 0);
    }

    #[test]
    fn cookies_are_unique_across_threads() {
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(std::thread::spawn(|| {
                let mut cookies = Vec::with_capacity(256);
                for _ in 0..256 {
                    cookies.push(generate_cookie());
                }
                cookies
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
