//! Informações geradas em tempo de build (versão do pacote, rustc, alvo)

include!(concat!(env!("OUT_DIR"), "/built.rs"));
