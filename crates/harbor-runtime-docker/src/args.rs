use harbor_core::RunContainerOptions;

/// Build the `docker run` arguments for a detached container
///
/// Docker accepts a single entrypoint binary; further entrypoint entries are
/// passed in front of the command. Only the first network is attached at
/// launch, the others are connected afterwards.
pub fn run_args(image: &str, options: &RunContainerOptions) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        format!("--name={}", options.name),
        format!("--hostname={}", options.name),
    ];

    if let Some(network) = options.networks.first() {
        args.push(format!("--network={network}"));
    }

    for (key, value) in &options.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }

    for volume in &options.volumes {
        args.push(format!("--volume={}:{}", volume.name, volume.dest));
    }

    if options.gpu {
        args.push("--gpus=all".to_string());
    }

    if let Some(work_dir) = &options.work_dir {
        args.push(format!("--workdir={work_dir}"));
    }

    let mut entrypoint = options.entrypoint.iter();
    if let Some(binary) = entrypoint.next() {
        args.push(format!("--entrypoint={binary}"));
    }

    args.push(image.to_string());
    args.extend(entrypoint.cloned());
    args.extend(options.cmd.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::VolumeBinding;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn test_minimal_run_args() {
        let options = RunContainerOptions {
            name: "harbor-job-run".to_string(),
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            ..Default::default()
        };

        assert_eq!(
            run_args("ubuntu", &options),
            vec![
                "run",
                "--detach",
                "--name=harbor-job-run",
                "--hostname=harbor-job-run",
                "ubuntu",
                "/bin/sh",
                "-c",
                "echo hi",
            ]
        );
    }

    #[test]
    fn test_full_run_args() {
        let options = RunContainerOptions {
            name: "harbor-job-train".to_string(),
            cmd: vec!["--epochs".to_string(), "3".to_string()],
            entrypoint: vec!["python".to_string(), "train.py".to_string()],
            env: BTreeMap::from([("A".to_string(), "1".to_string()), ("B".to_string(), "x y".to_string())]),
            networks: vec!["harbor-job".to_string(), "other".to_string()],
            volumes: vec![VolumeBinding {
                name: "harbor-job-data".to_string(),
                dest: "/data".to_string(),
            }],
            gpu: true,
            work_dir: Some("/app".to_string()),
        };

        assert_eq!(
            run_args("trainer:v2", &options),
            vec![
                "run",
                "--detach",
                "--name=harbor-job-train",
                "--hostname=harbor-job-train",
                "--network=harbor-job",
                "--env",
                "A=1",
                "--env",
                "B=x y",
                "--volume=harbor-job-data:/data",
                "--gpus=all",
                "--workdir=/app",
                "--entrypoint=python",
                "trainer:v2",
                "train.py",
                "--epochs",
                "3",
            ]
        );
    }
}
