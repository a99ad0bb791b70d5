use std::time::Duration;
use ureq::Error::*;

// Retry schedule cribbed from pip (pip/_internal/network/session.py):
// 0.25 * 2 ** (retries - 1) seconds between attempts, a fixed set of
// retryable status codes, plus transport errors that look transient.

const SLEEP_TIMES: &[u64] = &[250, 500, 1000, 2000, 4000]; // milliseconds
const RETRY_STATUS: &[u16] = &[500, 502, 503, 520, 527];
// https://docs.rs/ureq/2.6/ureq/enum.ErrorKind.html
// This is my attempt to pick out the ones that seem (potentially) transient
use ureq::ErrorKind::*;
const RETRY_ERRORKIND: &[ureq::ErrorKind] =
    &[Dns, ConnectionFailed, TooManyRedirects, Io, ProxyConnect];

pub fn call_with_retry(
    req: ureq::Request,
) -> std::result::Result<ureq::Response, ureq::Error> {
    // We preserve ureq's native Result/Error types, so callers can e.g.
    // customize how they handle 4xx responses.
    let mut iterator = SLEEP_TIMES.iter();
    loop {
        let this_req = req.clone();
        let result = this_req.call();
        match &result {
            Ok(_) => return result,
            Err(Status(status, _)) => {
                if !RETRY_STATUS.contains(status) {
                    return result;
                }
            }
            Err(err @ Transport(_)) => {
                if !RETRY_ERRORKIND.contains(&err.kind()) {
                    return result;
                }
            }
        }
        match iterator.next() {
            Some(sleep_time) => {
                std::thread::sleep(Duration::from_millis(*sleep_time))
            }
            None => return result,
        }
    }
}
