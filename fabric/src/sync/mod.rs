mod condvar;
mod mutex;

pub use condvar::*;
pub use mutex::*;

fn check(ret: libc::c_int, op: &str) {
    if ret != 0 {
        panic!("{op} failed: code {ret}");
    }
}
