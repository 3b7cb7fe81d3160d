use clap::Parser;
use distray::app::Options;
use distray::cluster::Cluster;
use distray::error::Result;
use distray::renderer::Renderer;
use log::error;

fn main() {
    env_logger::init();

    let (universe, cluster) = match Cluster::init() {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let cfg = Options::parse();
    let code = match render(cfg, &cluster) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    };

    // MPI_Finalize runs when the universe drops
    drop(universe);
    std::process::exit(code);
}

fn render(cfg: Options, cluster: &Cluster) -> Result<()> {
    let renderer = Renderer::init(cfg, cluster)?;
    renderer.run(cluster)
}
