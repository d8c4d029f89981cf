use std::io::{self, Read};

/// Reads and discards whatever is left on `reader`, returning how many
/// bytes that was. Read errors end the drain silently.
///
/// Behind hyper's sized body reader this only sees bytes up to the
/// declared `Content-Length`; anything a client sends past that stays on
/// the connection.
pub fn drain(reader: &mut dyn Read) -> u64 {
    let mut buf = [0u8; 8192];
    let mut total = 0;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return total,
            Ok(n) => total += n as u64,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("drain stopped: {}", err);
                return total;
            }
        }
    }
}

/// Content type for a file served straight from the document root.
pub fn content_type(path: &str) -> &'static str {
    if path.ends_with(".pack") {
        "application/x-git-packed-objects"
    } else if path.ends_with(".idx") {
        "application/x-git-packed-objects-toc"
    } else if path.contains("/objects/") && !path.contains("/objects/info/") {
        "application/x-git-loose-object"
    } else if path.ends_with(".html") || path.ends_with(".htm") {
        "text/html; charset=utf-8"
    } else if path.ends_with("/HEAD")
        || path.ends_with("/info/refs")
        || path.ends_with("/objects/info/packs")
        || path.ends_with(".txt")
    {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}
