//! Deterministic storage-key derivation.

/// Replace every byte outside `[A-Za-z0-9@/_.-]` with `_`.
///
/// Keeps composite names (docker `"<image>:blob:<digest>"`, maven
/// `"<group>:<artifact>:<file>"`) and scoped npm names under control while
/// staying deterministic: the same logical name always lands on the same
/// object-store path.
pub fn sanitise(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '@' | '/' | '_' | '.' | '-' => c,
            _ => '_',
        })
        .collect()
}

/// `repositories/<repo-name>/<sanitised-name>/<version>/artifact`
pub fn storage_key(repo_name: &str, name: &str, version: &str) -> String {
    format!("repositories/{repo_name}/{}/{version}/artifact", sanitise(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitise_keeps_allowed_bytes() {
        assert_eq!(sanitise("@scope/pkg"), "@scope/pkg");
        assert_eq!(sanitise("commons-lang3"), "commons-lang3");
        assert_eq!(sanitise("github.com/pkg/errors"), "github.com/pkg/errors");
    }

    #[test]
    fn sanitise_replaces_everything_else() {
        assert_eq!(sanitise("library/alpine:blob:sha256:ab12"), "library/alpine_blob_sha256_ab12");
        assert_eq!(sanitise("weird name#1"), "weird_name_1");
    }

    #[test]
    fn sanitise_is_idempotent() {
        for name in ["@scope/pkg", "a:b:c", "x y#z", "plain"] {
            assert_eq!(sanitise(&sanitise(name)), sanitise(name));
        }
    }

    #[test]
    fn storage_key_shape() {
        assert_eq!(
            storage_key("npm", "express", "4.18.2"),
            "repositories/npm/express/4.18.2/artifact"
        );
        assert_eq!(
            storage_key("docker", "library/alpine:manifest:3.19", "3.19"),
            "repositories/docker/library/alpine_manifest_3.19/3.19/artifact"
        );
    }
}
