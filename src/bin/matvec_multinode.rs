use lamellar_kernels::bench::matvec::{run_matvec, MatvecSettings};
use lamellar_kernels::LamellarWorldBuilder;

fn main() -> anyhow::Result<()> {
    lamellar_kernels::init_tracing();
    let settings = MatvecSettings::from_config();
    let reports = LamellarWorldBuilder::new().launch(|world| run_matvec(world, &settings))?;
    for report in reports {
        let report = report?;
        tracing::debug!("pe {} finished, ok: {}", report.my_pe, report.ok());
    }
    Ok(())
}
