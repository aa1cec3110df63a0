use std::path::Path;

use crate::path::expand_tilde;

/// How a remote host is reached: the remote-exec program plus an optional identity file.
#[derive(Clone, Copy, Debug)]
pub struct RemoteShell<'a> {
    pub program: &'a str,
    pub identity_file: Option<&'a str>,
}

impl<'a> RemoteShell<'a> {
    pub fn new(program: &'a str, identity_file: Option<&'a str>) -> Self {
        Self {
            program,
            identity_file: identity_file.filter(|value| !value.trim().is_empty()),
        }
    }

    /// `<ssh> [-i identity] <login> '<remote command>'`
    pub fn command(&self, login: &str, remote_command: &str) -> Vec<String> {
        let mut argv = vec![self.program.to_string()];
        self.push_identity(&mut argv);
        argv.push(login.to_string());
        argv.push(remote_command.to_string());
        argv
    }

    /// Non-interactive liveness check that never prompts for credentials.
    pub fn probe(&self, login: &str, connect_timeout_secs: u64) -> Vec<String> {
        let mut argv = vec![
            self.program.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={connect_timeout_secs}"),
        ];
        self.push_identity(&mut argv);
        argv.push(login.to_string());
        argv.push("echo alive".to_string());
        argv
    }

    /// Value for rsync's `-e` flag, present only when an identity file is configured.
    pub fn rsync_transport(&self) -> Option<String> {
        let identity = self.identity_file?;
        let identity = expand_tilde(identity).to_string_lossy().into_owned();
        Some(shell_words::join([self.program, "-i", identity.as_str()]))
    }

    fn push_identity(&self, argv: &mut Vec<String>) {
        if let Some(identity) = self.identity_file {
            argv.push("-i".to_string());
            argv.push(expand_tilde(identity).to_string_lossy().into_owned());
        }
    }
}

/// `<rsync> --rsync-path <remote rsync> -r -t --delete [-e transport] <local>/ <target>`
pub fn rsync_command(
    rsync: &str,
    remote_rsync_path: &str,
    shell: &RemoteShell<'_>,
    local_dir: &Path,
    remote_target: &str,
) -> Vec<String> {
    let mut argv = vec![
        rsync.to_string(),
        "--rsync-path".to_string(),
        remote_rsync_path.to_string(),
        "-r".to_string(),
        "-t".to_string(),
        "--delete".to_string(),
    ];
    if let Some(transport) = shell.rsync_transport() {
        argv.push("-e".to_string());
        argv.push(transport);
    }
    argv.push(slash_terminated(local_dir));
    argv.push(remote_target.to_string());
    argv
}

/// Shell-quoted rendering of an argv, for logs and dry runs.
pub fn render_command(argv: &[String]) -> String {
    shell_words::join(argv)
}

fn slash_terminated(dir: &Path) -> String {
    let mut value = dir.to_string_lossy().into_owned();
    if !value.ends_with('/') {
        value.push('/');
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_places_identity_before_login() {
        let shell = RemoteShell::new("ssh", Some("/keys/octane"));
        assert_eq!(
            shell.command("alex@octane", "cd ~/irix && make"),
            vec!["ssh", "-i", "/keys/octane", "alex@octane", "cd ~/irix && make"]
        );
    }

    #[test]
    fn blank_identity_is_ignored() {
        let shell = RemoteShell::new("ssh", Some("  "));
        assert_eq!(shell.command("alex@octane", "true"), vec!["ssh", "alex@octane", "true"]);
        assert!(shell.rsync_transport().is_none());
    }

    #[test]
    fn probe_is_batch_mode_with_connect_timeout() {
        let shell = RemoteShell::new("ssh", None);
        assert_eq!(
            shell.probe("alex@indigo2", 5),
            vec![
                "ssh",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=5",
                "alex@indigo2",
                "echo alive"
            ]
        );
    }

    #[test]
    fn rsync_command_slash_terminates_local_dir() {
        let shell = RemoteShell::new("ssh", None);
        let argv = rsync_command(
            "rsync",
            "/usr/nekoware/bin/rsync",
            &shell,
            Path::new("/work/demo"),
            "alex@octane:~/irix",
        );
        assert_eq!(
            argv,
            vec![
                "rsync",
                "--rsync-path",
                "/usr/nekoware/bin/rsync",
                "-r",
                "-t",
                "--delete",
                "/work/demo/",
                "alex@octane:~/irix"
            ]
        );
    }

    #[test]
    fn rsync_command_passes_identity_through_transport() {
        let shell = RemoteShell::new("ssh", Some("/keys/my key"));
        let argv = rsync_command("rsync", "rsync", &shell, Path::new("/work/"), "a@b:c");
        let transport = argv.iter().position(|arg| arg == "-e").expect("-e flag");
        assert_eq!(argv[transport + 1], "ssh -i '/keys/my key'");
        assert_eq!(argv[transport + 2], "/work/");
    }

    #[test]
    fn render_quotes_arguments_with_spaces() {
        let argv = vec!["ssh".to_string(), "alex@octane".to_string(), "cd x && make".to_string()];
        assert_eq!(render_command(&argv), "ssh alex@octane 'cd x && make'");
    }
}
