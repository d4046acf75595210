//! Thin wrapper around the `texting_robots` crate: turn a downloaded
//! `robots.txt` body plus a status code into an allow/disallow decision.

use texting_robots::Robot;

/// The outcome of consulting robots.txt for one URL.
pub enum Policy {
    Allow,
    Disallow,
}

/// Parses `body` as a robots.txt document and checks whether `agent` may
/// fetch `path`. A non-2xx status for the robots.txt fetch itself is not
/// handled here; callers translate that into a "download error" before
/// reaching this function.
pub fn evaluate(body: &[u8], agent: &str, path: &str) -> Result<Policy, String> {
    let robot = Robot::new(agent, body).map_err(|e| e.to_string())?;
    if robot.allowed(path) {
        Ok(Policy::Allow)
    } else {
        Ok(Policy::Disallow)
    }
}

/// The first run of alphabetic characters in a User-Agent string, used as
/// the robots.txt group name (`SwarmfetchBot/1 (...)` -> `SwarmfetchBot`).
pub fn agent_token(user_agent: &str) -> &str {
    let end = user_agent
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(user_agent.len());
    &user_agent[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_word() {
        assert_eq!(agent_token("SwarmfetchBot/1 (foo)"), "SwarmfetchBot");
        assert_eq!(agent_token("abc"), "abc");
    }

    #[test]
    fn disallow_all_blocks_everything() {
        let body = b"User-agent: *\nDisallow: /\n";
        match evaluate(body, "SwarmfetchBot", "/x").unwrap() {
            Policy::Disallow => {}
            Policy::Allow => panic!("expected disallow"),
        }
    }

    #[test]
    fn allow_all_permits_path() {
        let body = b"User-agent: *\nAllow: /\n";
        match evaluate(body, "SwarmfetchBot", "/x").unwrap() {
            Policy::Allow => {}
            Policy::Disallow => panic!("expected allow"),
        }
    }
}
