use reqwest::cookie::Jar;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One line of a Netscape/Mozilla cookie file:
/// `domain, include_subdomains, path, secure, expires, name, value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetscapeCookie {
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub expires: i64,
    pub name: String,
    pub value: String,
}

/// Parses a cookie file, skipping `#` comments and blank lines. Fields are
/// tab-separated; whitespace splitting is the fallback for tools that use
/// spaces, in which case a value containing spaces is re-joined.
pub fn parse_cookie_file(content: &str) -> Vec<NetscapeCookie> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                fields = line.split_whitespace().collect();
            }
            if fields.len() < 7 {
                return None;
            }
            let value = if fields.len() > 7 {
                fields[6..].join(" ")
            } else {
                fields[6].to_string()
            };
            Some(NetscapeCookie {
                domain: fields[0].to_string(),
                path: fields[2].to_string(),
                secure: fields[3].eq_ignore_ascii_case("true"),
                expires: fields[4].parse().unwrap_or(0),
                name: fields[5].to_string(),
                value,
            })
        })
        .collect()
}

/// Loads a cookie file into a jar for the shared client. Secure cookies are
/// registered against an `https` URL so they are only attached to TLS
/// requests. Cookies already expired at load time are dropped.
pub fn load_jar(path: &Path) -> io::Result<Arc<Jar>> {
    let content = std::fs::read_to_string(path)?;
    let jar = Arc::new(Jar::default());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    for cookie in parse_cookie_file(&content) {
        if cookie.expires != 0 && cookie.expires < now {
            continue;
        }
        let host = cookie.domain.trim_start_matches('.');
        if host.is_empty() {
            continue;
        }
        let scheme = if cookie.secure { "https" } else { "http" };
        let Ok(url) = format!("{scheme}://{host}/").parse::<reqwest::Url>() else {
            continue;
        };
        let mut entry = format!(
            "{}={}; Domain={}; Path={}",
            cookie.name, cookie.value, host, cookie.path
        );
        if cookie.secure {
            entry.push_str("; Secure");
        }
        jar.add_cookie_str(&entry, &url);
    }
    Ok(jar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tab_separated_lines() {
        let content = "# Netscape HTTP Cookie File\n\
                       \n\
                       example.com\tTRUE\t/\tFALSE\t0\tsession\tabc123\n\
                       .example.org\tTRUE\t/app\tTRUE\t4102444800\ttoken\txyz\n";
        let cookies = parse_cookie_file(content);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "session");
        assert_eq!(cookies[0].value, "abc123");
        assert!(!cookies[0].secure);
        assert_eq!(cookies[1].domain, ".example.org");
        assert_eq!(cookies[1].path, "/app");
        assert!(cookies[1].secure);
    }

    #[test]
    fn falls_back_to_whitespace_splitting() {
        let content = "example.com TRUE / FALSE 0 name value with spaces\n";
        let cookies = parse_cookie_file(content);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "name");
        assert_eq!(cookies[0].value, "value with spaces");
    }

    #[test]
    fn skips_short_and_comment_lines() {
        let content = "# comment\ntoo\tfew\tfields\n";
        assert!(parse_cookie_file(content).is_empty());
    }

    #[test]
    fn jar_loads_from_disk() {
        let path = std::env::temp_dir().join(format!(
            "grapnel-cookies-{}.txt",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "example.com\tTRUE\t/\tFALSE\t0\tsession\tabc123\n\
             example.com\tTRUE\t/\tFALSE\t1\texpired\tgone\n",
        )
        .expect("write cookie file");

        let jar = load_jar(&path).expect("load jar");
        let url = "http://example.com/".parse::<reqwest::Url>().expect("url");
        let header = reqwest::cookie::CookieStore::cookies(jar.as_ref(), &url);
        let header = header.expect("cookie header present");
        let header = header.to_str().expect("ascii");
        assert!(header.contains("session=abc123"));
        assert!(!header.contains("expired"));

        let _ = std::fs::remove_file(path);
    }
}
