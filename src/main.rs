mod config;
mod error;
mod intake;
mod logging;
mod pipeline;
mod resize;
mod rmbg;
mod routes;

use anyhow::Result;
use log::info;
use std::sync::Arc;
use warp::Filter;

use config::Config;
use pipeline::Pipeline;
use rmbg::Rmbg;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    logging::init(&config.log_file)?;

    let model = Rmbg::new(config.model_id.clone(), &config.model_path)?;
    info!("model {} ready", model.model_id());

    let pipeline = Pipeline::new(Arc::new(model), config.max_dimension);
    let api = routes::remove_background(pipeline, config.max_upload_bytes)
        .recover(error::handle_rejection)
        .with(warp::log("rmbg_server::access"));

    info!("listening on http://{}", config.addr());
    warp::serve(api).run(config.addr()).await;

    Ok(())
}
