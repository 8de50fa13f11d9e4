use std::ffi::OsStr;
use sysinfo::{Pid, Process, System};

/// Whether another process of `job_name` is running on this host.
pub fn already_running(job_name: &str) -> bool {
    let system = System::new_all();
    let own_pid = sysinfo::get_current_pid().ok();
    let others: Vec<Pid> = system
        .processes()
        .iter()
        .filter(|(pid, _)| Some(**pid) != own_pid)
        .filter(|(_, process)| matches_job(process, job_name))
        .map(|(pid, _)| *pid)
        .collect();

    if others.is_empty() {
        return false;
    }
    tracing::warn!(
        job = job_name,
        pids = ?others,
        "job is already running; exiting to avoid overloading the database"
    );
    true
}

fn matches_job(process: &Process, job_name: &str) -> bool {
    process_matches(process.name(), process.cmd(), job_name)
}

fn process_matches<S: AsRef<OsStr>>(name: &OsStr, cmd: &[S], job_name: &str) -> bool {
    if job_name.is_empty() {
        return false;
    }
    name.to_string_lossy() == job_name
        || cmd
            .iter()
            .take(2)
            .any(|arg| arg.as_ref().to_string_lossy().ends_with(job_name))
}
