use crate::config::config::Config;

pub fn banner(config: &Config) -> String {
    format!(
        r#"
   ___  ___ ___ _____/ /
  / _ \/ _ `/ // / _  / 
 / .__/\_,_/\_, /\_,_/  Ephemeral SSH payments
/_/        /___/        

payd v{}
Starting server on {}:{}
"#,
        env!("CARGO_PKG_VERSION"),
        config.server.bind_addr,
        config.server.port,
    )
}

pub fn print_banner(config: &Config) {
    println!("{}", banner(config));
}
