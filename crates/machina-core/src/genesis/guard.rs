//! Source guard: a conservative token scan over plugin source.
//!
//! Defense-in-depth, not a sandbox: the compile and load stages run under
//! process limits regardless. The guard blocks the obvious process, network,
//! and memory-privilege escalations before they ever reach the compiler.
//! Case-insensitive substring matching keeps it cheap and predictable.

use super::GenesisError;

/// Banned call-site tokens.
const BANNED_TOKENS: &[&str] = &[
    "system(",
    "popen(",
    "fork(",
    "vfork(",
    "posix_spawn",
    "execl(",
    "execle(",
    "execlp(",
    "execv(",
    "execve(",
    "execvp(",
    "execvpe(",
    "fexecve(",
    "socket(",
    "connect(",
    "bind(",
    "listen(",
    "accept(",
    "mprotect(",
    "ptrace(",
    "syscall(",
    "prctl(",
    "unshare(",
    "clone(",
    "setuid(",
    "setgid(",
    "setreuid(",
    "setregid(",
    "capset(",
    "dlopen(",
    "dlsym(",
    "loadlibrary",
    "getprocaddress",
    "asm(",
    "__asm",
    "inline asm",
    "mmap(",
    "munmap(",
    "mremap(",
    "mount(",
    "umount(",
    "pivot_root(",
    "sethostname(",
    "setdomainname(",
    "keyctl(",
    "add_key(",
    "request_key(",
];

/// Banned headers; includes the libc convenience headers that reach
/// `system()`/`popen()` indirectly.
const BANNED_HEADERS: &[&str] = &[
    "<unistd.h>",
    "<sys/socket.h>",
    "<netinet",
    "<arpa/inet.h>",
    "<sys/mman.h>",
    "<sys/ptrace.h>",
    "<sys/prctl.h>",
    "<sys/syscall.h>",
    "<windows.h>",
    "<cstdlib>",
    "<cstdio>",
    "<cstring>",
];

/// Scans `source` against the banned token and header lists.
///
/// # Errors
///
/// Returns [`GenesisError::GuardViolation`] naming the failing class. The
/// specific token is deliberately not echoed back - the caller's source is
/// attacker-influenced and the error lands in journals.
pub fn scan_source(source: &str) -> Result<(), GenesisError> {
    let lowered = source.to_lowercase();

    if BANNED_TOKENS.iter().any(|t| lowered.contains(t)) {
        return Err(GenesisError::GuardViolation(
            "genesis guard: source contains banned APIs/tokens".to_string(),
        ));
    }
    if BANNED_HEADERS.iter().any(|h| lowered.contains(h)) {
        return Err(GenesisError::GuardViolation(
            "genesis guard: source includes banned headers".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_source_passes() {
        let src = r#"
            extern "C" int machina_plugin_abi_version() { return 1; }
            static int add(int a, int b) { return a + b; }
        "#;
        assert!(scan_source(src).is_ok());
    }

    #[test]
    fn process_apis_blocked() {
        for src in [
            "int main() { system(\"ls\"); }",
            "auto f = popen(\"id\", \"r\");",
            "execve(path, argv, envp);",
            "fork();",
        ] {
            let err = scan_source(src).unwrap_err();
            assert!(err.to_string().contains("banned APIs"), "{src}");
        }
    }

    #[test]
    fn network_and_memory_apis_blocked() {
        assert!(scan_source("int s = socket(AF_INET, SOCK_STREAM, 0);").is_err());
        assert!(scan_source("bind(s, addr, len);").is_err());
        assert!(scan_source("mprotect(p, n, PROT_EXEC);").is_err());
        assert!(scan_source("mmap(0, n, prot, flags, fd, 0);").is_err());
        assert!(scan_source("ptrace(PTRACE_ATTACH, pid, 0, 0);").is_err());
    }

    #[test]
    fn banned_headers_blocked_case_insensitively() {
        assert!(scan_source("#include <unistd.h>").is_err());
        assert!(scan_source("#include <CSTDLIB>").is_err());
        assert!(scan_source("#include <sys/mman.h>").is_err());
        // Benign headers pass.
        assert!(scan_source("#include <string>\n#include <vector>").is_ok());
    }

    #[test]
    fn dynamic_loading_blocked() {
        assert!(scan_source("void* h = dlopen(path, RTLD_NOW);").is_err());
        assert!(scan_source("auto p = DLSYM(h, \"f\");").is_err());
    }
}
