//! Process CPU time for run metadata, via
//! `clock_gettime(CLOCK_PROCESS_CPUTIME_ID)`.
//!
//! Inline FFI instead of a `libc` dependency. Other platforms report `None`
//! and the report omits the `ProcessCpuNs` line.

#[cfg(any(target_os = "linux", target_os = "macos"))]
#[repr(C)]
struct Timespec {
    tv_sec: i64,
    tv_nsec: i64,
}

#[cfg(target_os = "linux")]
const CLOCK_PROCESS_CPUTIME_ID: i32 = 2;

#[cfg(target_os = "macos")]
const CLOCK_PROCESS_CPUTIME_ID: i32 = 12;

#[cfg(any(target_os = "linux", target_os = "macos"))]
extern "C" {
    fn clock_gettime(clk_id: i32, tp: *mut Timespec) -> i32;
}

/// CPU time consumed by every thread of this process so far, in nanoseconds.
#[cfg(all(
    any(target_os = "linux", target_os = "macos"),
    target_pointer_width = "64"
))]
pub(crate) fn process_cpu_ns() -> Option<u64> {
    let mut ts = Timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec with the platform's 64-bit layout.
    let ret = unsafe { clock_gettime(CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    if ret != 0 {
        return None;
    }
    Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

#[cfg(not(all(
    any(target_os = "linux", target_os = "macos"),
    target_pointer_width = "64"
)))]
pub(crate) fn process_cpu_ns() -> Option<u64> {
    None
}

#[cfg(test)]
#[cfg(all(
    any(target_os = "linux", target_os = "macos"),
    target_pointer_width = "64"
))]
mod tests {
    use super::*;

    #[test]
    fn process_cpu_time_advances_during_compute() {
        let before = process_cpu_ns().expect("process cpu clock");
        let mut buf = [0u8; 4096];
        for i in 0u64..50_000 {
            for b in &mut buf {
                *b = b.wrapping_add(i as u8).wrapping_mul(31);
            }
        }
        std::hint::black_box(&buf);
        let after = process_cpu_ns().expect("process cpu clock");
        assert!(
            after > before,
            "process CPU clock should advance during compute: before={before}, after={after}"
        );
    }
}
