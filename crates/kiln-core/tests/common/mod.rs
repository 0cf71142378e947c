//! Shared fixtures: a minimal in-test HTTP server, archive builders,
//! and settings rooted in a tempdir.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use kiln_core::Settings;

/// Build a `.tar.gz` archive from `(entry name, content)` pairs.
pub fn tgz(entries: &[(&str, &str)]) -> Vec<u8> {
    let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut tar = tar::Builder::new(gz);
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, *name, content.as_bytes())
            .unwrap();
    }
    tar.into_inner().unwrap().finish().unwrap()
}

pub fn sha256_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serve `files` (path → body) over HTTP/1.1 on a random local port;
/// returns the base URL. With `ranged` the server advertises and
/// honors byte ranges.
pub async fn serve(files: HashMap<String, Vec<u8>>, ranged: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            let files = files.clone();
            tokio::spawn(handle(sock, files, ranged));
        }
    });
    format!("http://{addr}")
}

async fn handle(
    mut sock: tokio::net::TcpStream,
    files: HashMap<String, Vec<u8>>,
    ranged: bool,
) {
    let mut buf = vec![0u8; 16 * 1024];
    let mut read = 0;
    loop {
        let Ok(n) = sock.read(&mut buf[read..]).await else {
            return;
        };
        if n == 0 {
            break;
        }
        read += n;
        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
            break;
        }
    }
    let req = String::from_utf8_lossy(&buf[..read]).into_owned();
    let mut first = req.lines().next().unwrap_or("").split_whitespace();
    let method = first.next().unwrap_or("").to_string();
    let path = first.next().unwrap_or("").to_string();

    let range = req
        .lines()
        .find_map(|l| l.strip_prefix("Range: bytes="))
        .and_then(|spec| {
            let (a, b) = spec.trim().split_once('-')?;
            Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?))
        });

    let resp = match files.get(&path) {
        Some(body) => {
            let accept = if ranged {
                "Accept-Ranges: bytes\r\n"
            } else {
                ""
            };
            match range {
                Some((start, end)) if ranged && end < body.len() => {
                    let slice = &body[start..=end];
                    let mut head = format!(
                        "HTTP/1.1 206 Partial Content\r\n{accept}Content-Length: {}\r\nContent-Range: bytes {start}-{end}/{}\r\nConnection: close\r\n\r\n",
                        slice.len(),
                        body.len()
                    )
                    .into_bytes();
                    if method != "HEAD" {
                        head.extend_from_slice(slice);
                    }
                    head
                }
                _ => {
                    let mut head = format!(
                        "HTTP/1.1 200 OK\r\n{accept}Content-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    )
                    .into_bytes();
                    if method != "HEAD" {
                        head.extend_from_slice(body);
                    }
                    head
                }
            }
        }
        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
    };
    let _ = sock.write_all(&resp).await;
    let _ = sock.shutdown().await;
}

/// Settings rooted at `top`, configured for an `arm-linux` target.
pub fn settings(top: &Path) -> Settings {
    let s = Settings::with_top_dir(top);
    s.set("MACHINEARCH", "arm");
    s
}

/// The temp directory of a cross carton built with [`settings`].
pub fn temp_dir_of(top: &Path, carton: &str, version: &str) -> PathBuf {
    top.join("build/tmp/work/arm-linux")
        .join(carton)
        .join(version)
        .join("temp")
}

/// Assert the `.done` markers for `stages` all exist under `temp`.
pub fn assert_markers(temp: &Path, stages: &[&str]) {
    for stage in stages {
        let marker = temp.join(format!("{stage}.done"));
        assert!(marker.exists(), "missing marker {}", marker.display());
    }
}

/// Read the run counter at `path`, 0 when absent.
pub fn counter(path: &Path) -> u32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Increment the run counter at `path`.
pub fn bump(path: &Path) {
    let next = counter(path) + 1;
    std::fs::write(path, next.to_string()).unwrap();
}
