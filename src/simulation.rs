use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::access_point::AccessPoint;
use crate::channel::Channel;
use crate::config::SimulationConfig;
use crate::error::SimulationError;
use crate::node::{start_receiving, Interruption, NodeContext, SimEnv};
use crate::scheduler::{Scheduler, Time};
use crate::station::Station;
use crate::stats::{Stats, StatsSummary};
use crate::timing::Timing;

/// One simulation run: the engine, the shared medium and every node.
pub struct Simulator {
    scheduler: Scheduler<Interruption>,
    cx: NodeContext,
    ap_list: Vec<Rc<AccessPoint>>,
    stations_list: Rc<Vec<Rc<Station>>>,
    simulator_initialized: bool,
}

impl Simulator {
    pub fn new(config: SimulationConfig) -> Result<Simulator, SimulationError> {
        config.validate()?;
        let timing = Timing::new(&config)?;
        let scheduler = Scheduler::new(config.simulation_time);
        let cx = NodeContext {
            env: scheduler.env(),
            timing: Rc::new(timing),
            channel: Rc::new(RefCell::new(Channel::new(&config.channel))),
            stats: Rc::new(RefCell::new(Stats::new(
                config.number_of_ap,
                config.number_of_stations,
            ))),
            rng: Rc::new(RefCell::new(ChaCha8Rng::seed_from_u64(config.seed))),
            config: Rc::new(config),
        };
        Ok(Simulator {
            scheduler,
            cx,
            ap_list: Vec::new(),
            stations_list: Rc::new(Vec::new()),
            simulator_initialized: false,
        })
    }

    /// Creates the access points and stations and starts their receive loops.
    pub fn initialize(&mut self) {
        if self.simulator_initialized {
            log::warn!("[{}] - Simulator is already initialized.", self.now());
            return;
        }
        let config = Rc::clone(&self.cx.config);
        let stations: Vec<Rc<Station>> = (0..config.number_of_stations)
            .map(|i| Rc::new(Station::new(i, self.cx.clone())))
            .collect();
        self.stations_list = Rc::new(stations);
        self.ap_list = (0..config.number_of_ap)
            .map(|i| {
                Rc::new(AccessPoint::new(
                    i,
                    self.cx.clone(),
                    Rc::clone(&self.stations_list),
                ))
            })
            .collect();

        for access_point in &self.ap_list {
            start_receiving(access_point);
        }
        for station in self.stations_list.iter() {
            start_receiving(station);
        }
        self.simulator_initialized = true;
        log::info!("[{}] - Simulator is initialized.", self.now());
    }

    /// Runs every access point until the horizon and returns the statistics summary.
    pub fn run(&mut self) -> Result<StatsSummary, SimulationError> {
        if !self.simulator_initialized {
            return Err(SimulationError::NotInitialized);
        }
        for access_point in &self.ap_list {
            self.cx
                .env
                .process(Rc::clone(access_point).perform_transmission());
        }
        self.cx.env.process(print_simulation_progress(
            self.cx.env.clone(),
            self.cx.config.simulation_time,
        ));
        log::info!("[{}] - Simulation is started.", self.now());
        let end = self.scheduler.run();
        log::info!("[{}] - Simulation finished.", end);
        Ok(self.stats().summary())
    }

    pub fn now(&self) -> Time {
        self.scheduler.now()
    }

    /// Handles shared with every node: the engine, the channel and the counters.
    pub fn context(&self) -> &NodeContext {
        &self.cx
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.cx.config
    }

    pub fn stats(&self) -> Ref<'_, Stats> {
        self.cx.stats.borrow()
    }

    pub fn channel(&self) -> Ref<'_, Channel> {
        self.cx.channel.borrow()
    }

    pub fn access_points(&self) -> &[Rc<AccessPoint>] {
        &self.ap_list
    }

    pub fn stations(&self) -> &[Rc<Station>] {
        &self.stations_list
    }
}

/// Logs progress at every tenth of the horizon.
async fn print_simulation_progress(env: SimEnv, simulation_time: Time) {
    let step = simulation_time / 10.0;
    loop {
        if env.timeout(step).await.is_err() {
            continue;
        }
        let percent = ((env.now() / simulation_time) * 100.0).round();
        log::info!("Simulation in progress {}%", percent);
    }
}
