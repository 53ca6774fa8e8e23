use domshell_browser::CdpControl;
use domshell_core::{Config, Paths};
use domshell_shell::Kernel;

/// Run each line through one local kernel, in order, printing every result.
/// No policy gates apply: the caller is the local user.
pub async fn run(lines: &[String]) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    let control = CdpControl::new(config.browser.clone());
    control.connect().await.map_err(|e| {
        anyhow::anyhow!(
            "{}\nStart Chrome with --remote-debugging-port={} and try again.",
            e,
            config.browser.debug_port
        )
    })?;

    let mut kernel = Kernel::new(control);
    let mut failed = 0usize;
    for line in lines {
        let reply = kernel.execute(line).await;
        if lines.len() > 1 {
            println!("$ {}", line);
        }
        if reply.is_error {
            failed += 1;
            eprintln!("{}", reply.text);
        } else if !reply.text.is_empty() {
            println!("{}", reply.text);
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} commands failed", failed, lines.len());
    }
    Ok(())
}
