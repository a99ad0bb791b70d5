use crate::prelude::*;

use std::cmp;
use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};
use ureq::Agent;

use super::retry::call_with_retry;

// Semi-arbitrary, but ideally large enough to catch the whole zip index +
// dist-info data at the end of common wheel files in one request.
const LAZY_FETCH_SIZE: u64 = 10_000;

/// A file-like view of a remote URL that pulls ranges down on demand. This
/// is what lets us feed a remote wheel (or zip sdist) to ZipArchive and read
/// out one metadata member without downloading hundreds of megabytes of the
/// rest. No validators are sent: distribution files are immutable once
/// published, so the bytes can't change under us.
pub struct LazyRemoteFile {
    agent: Agent,
    url: Url,
    loaded: BTreeMap<u64, Vec<u8>>,
    length: u64,
    seek_pos: u64,
}

impl Seek for LazyRemoteFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let LazyRemoteFile {
            length, seek_pos, ..
        } = self;
        // Basic structure cribbed from io::Cursor. NB: this allows seeking
        // past the end of the file (and then read just returns EOF)
        let (base_pos, offset) = match pos {
            SeekFrom::Start(offset) => {
                *seek_pos = offset;
                return Ok(offset);
            }
            SeekFrom::End(offset) => (*length, offset),
            SeekFrom::Current(offset) => (*seek_pos, offset),
        };
        let new_pos = if offset >= 0 {
            base_pos.checked_add(offset as u64)
        } else {
            base_pos.checked_sub((offset.wrapping_neg()) as u64)
        };
        match new_pos {
            Some(n) => {
                *seek_pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

enum RangeResponse {
    Partial {
        offset: u64,
        total_len: u64,
        data: Box<dyn Read>,
    },
    Complete(Box<dyn Read>),
}

/// The only Content-Range shape that's actually useful to us, out of
/// everything https://datatracker.ietf.org/doc/html/rfc7233#section-4.2
/// allows.
fn parse_content_range(content_range: &str) -> Option<(u64, u64)> {
    static CONTENT_RANGE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^bytes ([0-9]+)-[0-9]+/([0-9]+)$").unwrap());

    let captures = CONTENT_RANGE_RE.captures(content_range)?;
    // unwraps safe because the groups only match valid ints
    let offset = captures.get(1).unwrap().as_str().parse().ok()?;
    let total_len = captures.get(2).unwrap().as_str().parse().ok()?;
    Some((offset, total_len))
}

fn fetch_range(agent: &Agent, url: &Url, range_header: &str) -> Result<RangeResponse> {
    trace!("fetching {} of {}", range_header, url);

    let response = call_with_retry(
        agent.request_url("GET", url).set("Range", range_header),
    )?;

    Ok(match response.status() {
        // 206 Partial Content
        206 => match response.header("Content-Range") {
            None => bail!("range response is missing Content-Range"),
            Some(content_range) => match parse_content_range(content_range) {
                None => bail!("failed to parse Content-Range {:?}", content_range),
                Some((offset, total_len)) => RangeResponse::Partial {
                    offset,
                    total_len,
                    data: Box::new(response.into_reader()),
                },
            },
        },
        // 200 Ok -> server doesn't like Range: requests and is just sending
        // the full data
        200 => RangeResponse::Complete(Box::new(response.into_reader())),
        status => bail!("expected 200 or 206 HTTP response, not {}", status),
    })
}

impl LazyRemoteFile {
    pub fn new(agent: &Agent, url: &Url) -> Result<LazyRemoteFile> {
        let mut remote = LazyRemoteFile {
            agent: agent.clone(),
            url: url.clone(),
            loaded: BTreeMap::new(),
            length: 0,
            seek_pos: 0,
        };
        // Bootstrap with a trailing range: for zip files that's where the
        // central directory lives, so this usually saves a round-trip.
        match fetch_range(agent, url, &format!("bytes=-{}", LAZY_FETCH_SIZE))? {
            RangeResponse::Partial {
                offset,
                total_len,
                mut data,
            } => {
                remote.length = total_len;
                remote.loaded.insert(offset, slurp(&mut data)?);
            }
            RangeResponse::Complete(mut data) => {
                warn!(
                    "server doesn't support range requests; \
                     fetching whole file into memory: {}",
                    url.as_str()
                );
                let buf = slurp(&mut data)?;
                // unwrap safe because: converting usize to u64
                remote.length = buf.len().try_into().unwrap();
                remote.loaded.insert(0, buf);
            }
        }
        Ok(remote)
    }

    fn load_range(&mut self, offset: u64, length: u64) -> Result<()> {
        match fetch_range(
            &self.agent,
            &self.url,
            &format!("bytes={}-{}", offset, offset.saturating_add(length) - 1),
        )? {
            RangeResponse::Partial {
                offset, mut data, ..
            } => {
                self.loaded.insert(offset, slurp(&mut data)?);
                Ok(())
            }
            RangeResponse::Complete(_) => {
                bail!("server abruptly stopped understanding range requests?!?")
            }
        }
    }
}

impl Read for LazyRemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        fn copy_loaded(
            offset: u64,
            loaded: &BTreeMap<u64, Vec<u8>>,
            buf: &mut [u8],
        ) -> Option<usize> {
            // find the btree entry that's closest to the requested offset, if any
            match loaded.range(..=offset).next_back() {
                None => None,
                Some((loaded_offset, loaded_data)) => {
                    if let Ok(slide) =
                        usize::try_from(offset.saturating_sub(*loaded_offset))
                    {
                        if slide < loaded_data.len() {
                            let usable_loaded_data = &loaded_data[slide..];
                            let len = cmp::min(buf.len(), usable_loaded_data.len());
                            buf[..len].copy_from_slice(&usable_loaded_data[..len]);
                            Some(len)
                        } else {
                            None
                        }
                    } else {
                        None
                    }
                }
            }
        }

        fn fix_err<T, E>(input: std::result::Result<T, E>) -> std::io::Result<T>
        where
            E: Into<Box<dyn std::error::Error + Send + Sync>>,
        {
            input.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        }

        let bytes_wanted =
            cmp::min(buf.len() as u64, self.length.saturating_sub(self.seek_pos));
        if bytes_wanted == 0 {
            return Ok(0);
        }
        // maybe we already have it in cache?
        if let Some(len) = copy_loaded(self.seek_pos, &self.loaded, buf) {
            self.seek_pos = self.seek_pos.saturating_add(fix_err(len.try_into())?);
            return Ok(len);
        }
        // otherwise, we need to fetch + fill in the cache
        // first find the empty gap around our current position
        let gap_start = match self.loaded.range(..=self.seek_pos).next_back() {
            Some((loaded_offset, loaded_data)) => {
                loaded_offset + (loaded_data.len() as u64)
            }
            None => 0,
        };
        let gap_end = match self.loaded.range(self.seek_pos + 1..).next() {
            Some((loaded_offset, _)) => *loaded_offset,
            None => self.length,
        };
        let fetch_start = if gap_end - self.seek_pos < LAZY_FETCH_SIZE {
            gap_end.saturating_sub(LAZY_FETCH_SIZE)
        } else {
            self.seek_pos
        };
        let fetch_end = fetch_start + LAZY_FETCH_SIZE;
        let fetch_start = fetch_start.clamp(gap_start, gap_end);
        let fetch_end = fetch_end.clamp(gap_start, gap_end);
        fix_err(self.load_range(fetch_start, fetch_end - fetch_start))?;
        // now it's definitely in cache
        if let Some(len) = copy_loaded(self.seek_pos, &self.loaded, buf) {
            self.seek_pos = self.seek_pos.saturating_add(fix_err(len.try_into())?);
            return Ok(len);
        }
        unreachable!("and you may ask yourself, well, how did I get here?")
    }
}
